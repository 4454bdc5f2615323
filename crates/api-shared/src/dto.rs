//! JSON shapes returned by the query APIs.
//!
//! Field names are camelCase on the wire. Ids are rendered in canonical 32-hex form; categories,
//! purposes and statuses by their snake_case names.

use consent_core::{
    AccessRequest, ConsentError, ConsentRecord, ConsentView, LedgerEvent, LedgerInfo,
    RequestView, StatusCheck,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// Error body for every non-2xx response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// One of `MISSING_PARAMETER`, `INVALID_INPUT`, `INVALID_PRINCIPAL`, `INVALID_ID`,
    /// `NOT_FOUND`, `FORBIDDEN`, `ALREADY_PROCESSED`, `LEDGER_UNAVAILABLE`, `INTERNAL_ERROR`.
    pub code: String,
    pub message: String,
}

impl From<&ConsentError> for ErrorBody {
    fn from(err: &ConsentError) -> Self {
        Self {
            code: err.code().as_str().to_owned(),
            message: err.public_message(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusRes {
    pub has_consent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
    pub is_expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<u64>,
}

impl From<StatusCheck> for StatusRes {
    fn from(s: StatusCheck) -> Self {
        Self {
            has_consent: s.has_consent,
            consent_id: s.consent_id.map(|id| id.to_string()),
            is_expired: s.is_expired,
            expiration_time: s.expiration_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRes {
    pub id: String,
    pub patient: String,
    pub provider: String,
    pub data_category: String,
    pub purpose: String,
    pub granted_at: u64,
    /// `0` means the consent never expires.
    pub expiration_time: u64,
    pub active: bool,
    pub is_expired: bool,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl From<ConsentView> for ConsentRes {
    fn from(view: ConsentView) -> Self {
        let ConsentRecord {
            id,
            patient,
            provider,
            data_category,
            purpose,
            granted_at,
            expiration_time,
            active,
            sequence,
            revoked_at,
            request_id,
        } = view.record;
        Self {
            id: id.to_string(),
            patient: patient.to_string(),
            provider: provider.to_string(),
            data_category: data_category.as_str().to_owned(),
            purpose: purpose.as_str().to_owned(),
            granted_at,
            expiration_time,
            active,
            is_expired: view.is_expired,
            sequence,
            revoked_at,
            request_id: request_id.map(|id| id.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConsentListRes {
    pub consents: Vec<ConsentRes>,
}

impl From<Vec<ConsentView>> for ConsentListRes {
    fn from(views: Vec<ConsentView>) -> Self {
        Self {
            consents: views.into_iter().map(ConsentRes::from).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestRes {
    pub id: String,
    pub requester: String,
    pub patient: String,
    pub data_category: String,
    pub purpose: String,
    pub requested_at: u64,
    pub expiration_time: u64,
    /// `pending`, `approved` or `denied`. An expired pending request keeps `pending`.
    pub status: String,
    pub is_expired: bool,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
}

impl From<RequestView> for RequestRes {
    fn from(view: RequestView) -> Self {
        let AccessRequest {
            id,
            requester,
            patient,
            data_category,
            purpose,
            requested_at,
            expiration_time,
            status,
            sequence,
            processed_at,
            consent_id,
        } = view.request;
        Self {
            id: id.to_string(),
            requester: requester.to_string(),
            patient: patient.to_string(),
            data_category: data_category.as_str().to_owned(),
            purpose: purpose.as_str().to_owned(),
            requested_at,
            expiration_time,
            status: status.as_str().to_owned(),
            is_expired: view.is_expired,
            sequence,
            processed_at,
            consent_id: consent_id.map(|id| id.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RequestListRes {
    pub requests: Vec<RequestRes>,
}

impl From<Vec<RequestView>> for RequestListRes {
    fn from(views: Vec<RequestView>) -> Self {
        Self {
            requests: views.into_iter().map(RequestRes::from).collect(),
        }
    }
}

/// One ledger entry: its sequence plus the tagged event payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventRes {
    pub sequence: u64,
    /// The event payload, discriminated by its `type` field.
    #[schema(value_type = Object)]
    pub event: serde_json::Value,
}

impl TryFrom<LedgerEvent> for EventRes {
    type Error = ConsentError;

    fn try_from(e: LedgerEvent) -> Result<Self, Self::Error> {
        let event = serde_json::to_value(&e.body).map_err(|err| {
            ConsentError::Internal(format!(
                "failed to render event {}: {}",
                e.sequence, err
            ))
        })?;
        Ok(Self {
            sequence: e.sequence,
            event,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventListRes {
    pub events: Vec<EventRes>,
}

impl TryFrom<Vec<LedgerEvent>> for EventListRes {
    type Error = ConsentError;

    fn try_from(events: Vec<LedgerEvent>) -> Result<Self, Self::Error> {
        Ok(Self {
            events: events
                .into_iter()
                .map(EventRes::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerInfoRes {
    pub reachable: bool,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_sequence: Option<u64>,
    pub applied_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lag: Option<u64>,
    pub message: String,
}

impl From<LedgerInfo> for LedgerInfoRes {
    fn from(info: LedgerInfo) -> Self {
        Self {
            reachable: info.reachable,
            backend: info.backend,
            head_sequence: info.head_sequence,
            applied_sequence: info.applied_sequence,
            lag: info.lag,
            message: info.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use consent_core::testutil::{granted, principal};
    use consent_core::EventBody;
    use consent_types::RecordId;

    use super::*;

    #[test]
    fn test_status_omits_absent_fields() {
        let json = serde_json::to_value(StatusRes::from(StatusCheck::none())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"hasConsent": false, "isExpired": false})
        );
    }

    #[test]
    fn test_event_payload_keeps_type_tag() {
        let res = EventRes::try_from(LedgerEvent {
            sequence: 7,
            body: granted("P1", "Q1"),
        })
        .unwrap();
        assert_eq!(res.sequence, 7);
        assert_eq!(res.event["type"], "consent_granted");
        assert_eq!(res.event["patient"], "P1");
    }

    #[test]
    fn test_error_body_hides_internal_detail() {
        let body = ErrorBody::from(&ConsentError::Internal("lock poisoned at shard 3".into()));
        assert_eq!(body.code, "INTERNAL_ERROR");
        assert!(!body.message.contains("shard"));

        let body = ErrorBody::from(&ConsentError::ConsentNotFound(RecordId::generate()));
        assert_eq!(body.code, "NOT_FOUND");
    }

    #[test]
    fn test_consent_res_renders_enum_names() {
        let EventBody::ConsentGranted(g) = granted("P1", "Q1") else {
            unreachable!()
        };
        let record = ConsentRecord {
            id: g.consent_id,
            patient: principal("P1"),
            provider: principal("Q1"),
            data_category: g.data_category,
            purpose: g.purpose,
            granted_at: g.granted_at,
            expiration_time: 0,
            active: true,
            sequence: 1,
            revoked_at: None,
            request_id: None,
        };
        let res = ConsentRes::from(ConsentView::at(record, g.granted_at));
        assert_eq!(res.data_category, "medical_records");
        assert_eq!(res.purpose, "treatment");
        assert_eq!(res.id.len(), 32);
    }
}
