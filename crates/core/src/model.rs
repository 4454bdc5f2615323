//! Entities materialised from the ledger and the read models returned by queries.
//!
//! Records are never mutated in place by callers: the projection rebuilds them from events.
//! `is_expired` is never stored; it is computed against a clock whenever a view is produced.

use consent_types::{DataCategory, Principal, Purpose, RecordId};
use serde::{Deserialize, Serialize};

/// `expiration_time` value meaning "never expires".
pub const NEVER_EXPIRES: u64 = 0;

/// Returns true if `expiration_time` has passed at `now`.
pub fn is_expired_at(expiration_time: u64, now: u64) -> bool {
    expiration_time != NEVER_EXPIRES && now >= expiration_time
}

/// A patient's permission for a provider to read one data category for one purpose.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: RecordId,
    pub patient: Principal,
    pub provider: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub granted_at: u64,
    pub expiration_time: u64,
    /// Only ever moves from `true` to `false`.
    pub active: bool,
    /// Sequence of the `ConsentGranted` event that created this record.
    pub sequence: u64,
    pub revoked_at: Option<u64>,
    /// The access request this consent was created from, if any.
    pub request_id: Option<RecordId>,
}

impl ConsentRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired_at(self.expiration_time, now)
    }

    /// Active and not expired.
    pub fn authorizes(&self, now: u64) -> bool {
        self.active && !self.is_expired(now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
        }
    }
}

/// A provider's request for consent, pending the patient's decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: RecordId,
    pub requester: Principal,
    pub patient: Principal,
    pub data_category: DataCategory,
    pub purpose: Purpose,
    pub requested_at: u64,
    pub expiration_time: u64,
    /// Set exactly once, from `Pending` to `Approved` or `Denied`.
    pub status: RequestStatus,
    pub sequence: u64,
    pub processed_at: Option<u64>,
    /// Consent created when the request was approved.
    pub consent_id: Option<RecordId>,
}

impl AccessRequest {
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired_at(self.expiration_time, now)
    }
}

/// A consent record with its derived expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentView {
    #[serde(flatten)]
    pub record: ConsentRecord,
    pub is_expired: bool,
}

impl ConsentView {
    pub fn at(record: ConsentRecord, now: u64) -> Self {
        let is_expired = record.is_expired(now);
        Self { record, is_expired }
    }
}

/// An access request with its derived expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: AccessRequest,
    pub is_expired: bool,
}

impl RequestView {
    pub fn at(request: AccessRequest, now: u64) -> Self {
        let is_expired = request.is_expired(now);
        Self { request, is_expired }
    }
}

/// Answer to "may this provider read this category of this patient's data?".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub has_consent: bool,
    pub consent_id: Option<RecordId>,
    pub is_expired: bool,
    pub expiration_time: Option<u64>,
}

impl StatusCheck {
    pub fn none() -> Self {
        Self {
            has_consent: false,
            consent_id: None,
            is_expired: false,
            expiration_time: None,
        }
    }
}

/// Which side of a consent or request a principal is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Patient,
    Provider,
}

/// Status filter for request listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RequestFilter {
    Pending,
    Approved,
    Denied,
    #[default]
    All,
}

impl RequestFilter {
    pub const ALL_FILTERS: [RequestFilter; 4] = [
        RequestFilter::Pending,
        RequestFilter::Approved,
        RequestFilter::Denied,
        RequestFilter::All,
    ];

    pub fn matches(&self, status: RequestStatus) -> bool {
        match self {
            RequestFilter::Pending => status == RequestStatus::Pending,
            RequestFilter::Approved => status == RequestStatus::Approved,
            RequestFilter::Denied => status == RequestStatus::Denied,
            RequestFilter::All => true,
        }
    }
}

impl std::str::FromStr for RequestFilter {
    type Err = crate::ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(RequestFilter::Pending),
            "approved" => Ok(RequestFilter::Approved),
            "denied" => Ok(RequestFilter::Denied),
            "all" => Ok(RequestFilter::All),
            other => Err(crate::ConsentError::InvalidInput(format!(
                "unknown request status filter '{}' (expected pending, approved, denied or all)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expiration_time: u64, active: bool) -> ConsentRecord {
        ConsentRecord {
            id: RecordId::generate(),
            patient: Principal::new("P1").unwrap(),
            provider: Principal::new("Q1").unwrap(),
            data_category: DataCategory::MedicalRecords,
            purpose: Purpose::Treatment,
            granted_at: 100,
            expiration_time,
            active,
            sequence: 1,
            revoked_at: None,
            request_id: None,
        }
    }

    #[test]
    fn test_expiry_is_inclusive_of_expiration_time() {
        assert!(!is_expired_at(NEVER_EXPIRES, u64::MAX));
        assert!(!is_expired_at(200, 199));
        assert!(is_expired_at(200, 200));
        assert!(is_expired_at(200, 201));
    }

    #[test]
    fn test_authorizes_requires_active_and_unexpired() {
        assert!(record(0, true).authorizes(1_000));
        assert!(record(2_000, true).authorizes(1_000));
        assert!(!record(500, true).authorizes(1_000));
        assert!(!record(0, false).authorizes(1_000));
    }

    #[test]
    fn test_consent_view_flattens_record() {
        let view = ConsentView::at(record(500, true), 1_000);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["is_expired"], true);
        assert_eq!(json["data_category"], "medical_records");
        assert_eq!(json["active"], true);
    }

    #[test]
    fn test_request_filter_parses_and_matches() {
        let filter: RequestFilter = "pending".parse().unwrap();
        assert!(filter.matches(RequestStatus::Pending));
        assert!(!filter.matches(RequestStatus::Approved));
        assert!(RequestFilter::All.matches(RequestStatus::Denied));
        assert!("rejected".parse::<RequestFilter>().is_err());
    }
}
