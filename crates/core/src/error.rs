use consent_types::{RecordId, TypeError};

use crate::ledger::LedgerError;

/// Boundary error codes.
///
/// Every [`ConsentError`] maps onto exactly one code. Callers and tests match on the code, not
/// on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MissingParameter,
    InvalidInput,
    InvalidPrincipal,
    InvalidId,
    NotFound,
    Forbidden,
    AlreadyProcessed,
    LedgerUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidPrincipal => "INVALID_PRINCIPAL",
            ErrorCode::InvalidId => "INVALID_ID",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::AlreadyProcessed => "ALREADY_PROCESSED",
            ErrorCode::LedgerUnavailable => "LEDGER_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    InvalidPrincipal(TypeError),
    #[error("{0}")]
    InvalidId(TypeError),
    #[error("requested range {from}..={to} exceeds maximum window of {max} entries")]
    RangeTooLarge { from: u64, to: u64, max: u64 },
    #[error("consent {0} not found")]
    ConsentNotFound(RecordId),
    #[error("access request {0} not found")]
    RequestNotFound(RecordId),
    #[error("caller is not permitted to {0}")]
    Forbidden(&'static str),
    #[error("consent {0} is already inactive")]
    AlreadyInactive(RecordId),
    #[error("access request {0} has already been processed")]
    AlreadyProcessed(RecordId),
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),
    #[error("ledger call timed out: {0}")]
    LedgerTimeout(#[source] LedgerError),
    #[error("ledger is corrupt: {0}")]
    LedgerCorrupt(String),
    #[error("projection sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConsentError {
    /// Returns the boundary code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ConsentError::MissingParameter(_) => ErrorCode::MissingParameter,
            ConsentError::InvalidInput(_) | ConsentError::RangeTooLarge { .. } => {
                ErrorCode::InvalidInput
            }
            ConsentError::InvalidPrincipal(_) => ErrorCode::InvalidPrincipal,
            ConsentError::InvalidId(_) => ErrorCode::InvalidId,
            ConsentError::ConsentNotFound(_) | ConsentError::RequestNotFound(_) => {
                ErrorCode::NotFound
            }
            ConsentError::Forbidden(_) => ErrorCode::Forbidden,
            ConsentError::AlreadyInactive(_) | ConsentError::AlreadyProcessed(_) => {
                ErrorCode::AlreadyProcessed
            }
            ConsentError::LedgerUnavailable(_) | ConsentError::LedgerTimeout(_) => {
                ErrorCode::LedgerUnavailable
            }
            ConsentError::LedgerCorrupt(_)
            | ConsentError::SequenceGap { .. }
            | ConsentError::InvalidConfig(_)
            | ConsentError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to hand to callers.
    ///
    /// Internal failures collapse to a generic text; their detail stays in server logs.
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::InternalError => "Internal error".to_owned(),
            ErrorCode::LedgerUnavailable => "Ledger unavailable".to_owned(),
            _ => self.to_string(),
        }
    }
}

impl From<TypeError> for ConsentError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::InvalidPrincipal(_) => ConsentError::InvalidPrincipal(err),
            TypeError::InvalidId(_) => ConsentError::InvalidId(err),
            TypeError::UnknownDataCategory(_) | TypeError::UnknownPurpose(_) => {
                ConsentError::InvalidInput(err.to_string())
            }
        }
    }
}

impl From<LedgerError> for ConsentError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Timeout { .. } => ConsentError::LedgerTimeout(err),
            LedgerError::Corrupt(detail) => ConsentError::LedgerCorrupt(detail),
            LedgerError::Rejected(detail) => ConsentError::Internal(detail),
            LedgerError::Unavailable(_) | LedgerError::Exhausted { .. } => {
                ConsentError::LedgerUnavailable(err)
            }
        }
    }
}

pub type ConsentResult<T> = std::result::Result<T, ConsentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_errors_map_to_distinct_codes() {
        let principal: ConsentError = TypeError::InvalidPrincipal("x".into()).into();
        let id: ConsentError = TypeError::InvalidId("x".into()).into();
        let category: ConsentError = TypeError::UnknownDataCategory("x".into()).into();

        assert_eq!(principal.code(), ErrorCode::InvalidPrincipal);
        assert_eq!(id.code(), ErrorCode::InvalidId);
        assert_eq!(category.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_revoke_of_inactive_surfaces_as_already_processed() {
        let err = ConsentError::AlreadyInactive(RecordId::generate());
        assert_eq!(err.code(), ErrorCode::AlreadyProcessed);
    }

    #[test]
    fn test_internal_detail_does_not_cross_boundary() {
        let err = ConsentError::Internal("shard 3 poisoned at 0xdeadbeef".into());
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.public_message(), "Internal error");

        let err: ConsentError = LedgerError::Exhausted {
            attempts: 4,
            last: "connection refused by 10.0.0.7".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::LedgerUnavailable);
        assert!(!err.public_message().contains("10.0.0.7"));
    }

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::AlreadyProcessed).unwrap();
        assert_eq!(json, "\"ALREADY_PROCESSED\"");
        assert_eq!(ErrorCode::MissingParameter.as_str(), "MISSING_PARAMETER");
    }
}
