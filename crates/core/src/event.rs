//! Ledger events.
//!
//! Events are the only thing ever written to the ledger. Each payload is denormalised: it carries
//! every field needed to rebuild the entity it touches, so the projection never has to look
//! anything up while folding.

use consent_types::{DataCategory, Principal, Purpose, RecordId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentGranted {
    pub consent_id: RecordId,
    pub patient: Principal,
    pub provider: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub granted_at: u64,
    pub expiration_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RecordId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRevoked {
    pub consent_id: RecordId,
    pub patient: Principal,
    pub provider: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub revoked_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequested {
    pub request_id: RecordId,
    pub requester: Principal,
    pub patient: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub requested_at: u64,
    pub expiration_time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessApproved {
    pub request_id: RecordId,
    pub requester: Principal,
    pub patient: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub consent_id: RecordId,
    pub processed_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDenied {
    pub request_id: RecordId,
    pub requester: Principal,
    pub patient: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub processed_at: u64,
}

/// Closed set of ledger transitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    ConsentGranted(ConsentGranted),
    ConsentRevoked(ConsentRevoked),
    AccessRequested(AccessRequested),
    AccessApproved(AccessApproved),
    AccessDenied(AccessDenied),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConsentGranted,
    ConsentRevoked,
    AccessRequested,
    AccessApproved,
    AccessDenied,
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::ConsentGranted(_) => EventKind::ConsentGranted,
            EventBody::ConsentRevoked(_) => EventKind::ConsentRevoked,
            EventBody::AccessRequested(_) => EventKind::AccessRequested,
            EventBody::AccessApproved(_) => EventKind::AccessApproved,
            EventBody::AccessDenied(_) => EventKind::AccessDenied,
        }
    }

    /// The `(patient, provider)` pair the event concerns.
    pub fn parties(&self) -> (&Principal, &Principal) {
        match self {
            EventBody::ConsentGranted(e) => (&e.patient, &e.provider),
            EventBody::ConsentRevoked(e) => (&e.patient, &e.provider),
            EventBody::AccessRequested(e) => (&e.patient, &e.requester),
            EventBody::AccessApproved(e) => (&e.patient, &e.requester),
            EventBody::AccessDenied(e) => (&e.patient, &e.requester),
        }
    }

    pub fn involves(&self, principal: &Principal) -> bool {
        let (patient, provider) = self.parties();
        patient == principal || provider == principal
    }
}

/// An event as recorded by the ledger, with its position in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub sequence: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_is_tagged_and_flat() {
        let event = LedgerEvent {
            sequence: 7,
            body: EventBody::ConsentRevoked(ConsentRevoked {
                consent_id: RecordId::generate(),
                patient: Principal::new("P1").unwrap(),
                provider: Principal::new("Q1").unwrap(),
                data_category: DataCategory::VitalSigns,
                purpose: Purpose::Treatment,
                revoked_at: 42,
            }),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["type"], "consent_revoked");
        assert_eq!(json["data_category"], "vital_signs");

        let back: LedgerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let json = r#"{"sequence":1,"type":"consent_expired","consent_id":"x"}"#;
        assert!(serde_json::from_str::<LedgerEvent>(json).is_err());
    }

    #[test]
    fn test_involves_matches_either_party() {
        let body = EventBody::AccessRequested(AccessRequested {
            request_id: RecordId::generate(),
            requester: Principal::new("Q1").unwrap(),
            patient: Principal::new("P1").unwrap(),
            data_category: DataCategory::GeneticData,
            purpose: Purpose::Research,
            requested_at: 1,
            expiration_time: 0,
        });
        assert!(body.involves(&Principal::new("Q1").unwrap()));
        assert!(body.involves(&Principal::new("P1").unwrap()));
        assert!(!body.involves(&Principal::new("Q2").unwrap()));
        assert_eq!(body.kind(), EventKind::AccessRequested);
    }
}
