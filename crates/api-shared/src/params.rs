//! Query-parameter parsing.
//!
//! Raw parameters arrive as optional strings. Each helper turns one into a validated core type
//! or the boundary error for it: absent or blank values are `MISSING_PARAMETER`, malformed
//! principals `INVALID_PRINCIPAL`, malformed ids `INVALID_ID`, and unknown enum values or
//! non-numeric sequences `INVALID_INPUT`.

use consent_core::{ConsentError, ConsentResult, RequestFilter};
use consent_types::{DataCategory, Principal, Purpose, RecordId};
use serde::Deserialize;
use utoipa::IntoParams;

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct StatusQuery {
    pub patient: Option<String>,
    pub provider: Option<String>,
    /// e.g. `medical_records`
    pub data_category: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ConsentListQuery {
    /// `true` to include revoked and expired records. Defaults to `false`.
    pub include_expired: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RequestListQuery {
    /// `pending`, `approved`, `denied` or `all` (default).
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Only events involving this principal.
    pub principal: Option<String>,
    pub from_seq: Option<String>,
    pub to_seq: Option<String>,
}

/// The trimmed value, or `MissingParameter` if it is absent or blank.
pub fn required<'a>(name: &'static str, value: Option<&'a str>) -> ConsentResult<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConsentError::MissingParameter(name)),
    }
}

pub fn principal(name: &'static str, value: Option<&str>) -> ConsentResult<Principal> {
    Ok(Principal::new(required(name, value)?)?)
}

/// Like [`principal`], but a blank value means "not given".
pub fn optional_principal(value: Option<&str>) -> ConsentResult<Option<Principal>> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(Some(Principal::new(v)?)),
        _ => Ok(None),
    }
}

pub fn record_id(value: &str) -> ConsentResult<RecordId> {
    Ok(RecordId::parse(value.trim())?)
}

pub fn data_category(name: &'static str, value: Option<&str>) -> ConsentResult<DataCategory> {
    Ok(required(name, value)?.parse::<DataCategory>()?)
}

pub fn purpose(name: &'static str, value: Option<&str>) -> ConsentResult<Purpose> {
    Ok(required(name, value)?.parse::<Purpose>()?)
}

pub fn sequence(name: &'static str, value: Option<&str>) -> ConsentResult<u64> {
    let raw = required(name, value)?;
    raw.parse::<u64>().map_err(|_| {
        ConsentError::InvalidInput(format!("{} must be a non-negative integer, got '{}'", name, raw))
    })
}

pub fn flag(name: &'static str, value: Option<&str>) -> ConsentResult<bool> {
    match value.map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(ConsentError::InvalidInput(format!(
            "{} must be true or false, got '{}'",
            name, v
        ))),
    }
}

pub fn request_filter(value: Option<&str>) -> ConsentResult<RequestFilter> {
    match value.map(str::trim) {
        None | Some("") => Ok(RequestFilter::All),
        Some(v) => v.parse(),
    }
}
