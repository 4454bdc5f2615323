//! # API REST
//!
//! Read-only REST API for the consent ledger.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - The OpenAPI document at `/api-docs/openapi.json`
//! - REST-specific concerns (JSON serialization, CORS, status codes)
//!
//! Uses `api-shared` for response types and parameter parsing. Writes are not exposed here; they
//! reach the ledger through the signing component (the `consent` CLI locally).

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;

use api_shared::params::{self, ConsentListQuery, EventsQuery, RequestListQuery, StatusQuery};
use api_shared::{
    ConsentListRes, ConsentRes, ErrorBody, EventListRes, EventRes, HealthRes, HealthService,
    LedgerInfoRes, RequestListRes, RequestRes, StatusRes,
};
use consent_core::{ConsentCore, ConsentError, ErrorCode};

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    core: ConsentCore,
    health: HealthService,
}

impl AppState {
    pub fn new(core: ConsentCore) -> Self {
        let health = HealthService::new(core.queries().clone());
        Self { core, health }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        check_status,
        get_consent,
        consents_for_patient,
        consents_for_provider,
        get_request,
        requests_for_patient,
        requests_for_provider,
        events,
        ledger_info,
    ),
    components(schemas(
        HealthRes,
        ErrorBody,
        StatusRes,
        ConsentRes,
        ConsentListRes,
        RequestRes,
        RequestListRes,
        EventRes,
        EventListRes,
        LedgerInfoRes,
    ))
)]
pub struct ApiDoc;

/// Builds the router for every query endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(check_status))
        .route("/consent/:id", get(get_consent))
        .route("/consents/patient/:patient", get(consents_for_patient))
        .route("/consents/provider/:provider", get(consents_for_provider))
        .route("/requests/:id", get(get_request))
        .route("/requests/patient/:patient", get(requests_for_patient))
        .route("/requests/provider/:provider", get(requests_for_provider))
        .route("/events", get(events))
        .route("/ledger/info", get(ledger_info))
        .route("/api-docs/openapi.json", get(openapi))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A [`ConsentError`] rendered as an HTTP response with an [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError(pub ConsentError);

impl From<ConsentError> for ApiError {
    fn from(err: ConsentError) -> Self {
        Self(err)
    }
}

/// HTTP status for each boundary code.
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::MissingParameter
        | ErrorCode::InvalidInput
        | ErrorCode::InvalidPrincipal
        | ErrorCode::InvalidId => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::AlreadyProcessed => StatusCode::CONFLICT,
        ErrorCode::LedgerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.code());
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => tracing::error!("Query error: {:?}", self.0),
            StatusCode::SERVICE_UNAVAILABLE => tracing::warn!("Ledger unavailable: {:?}", self.0),
            _ => tracing::debug!(code = %self.0.code(), "rejected request: {}", self.0),
        }
        (status, Json(ErrorBody::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Liveness check. Does not touch the ledger.
#[axum::debug_handler]
async fn health() -> Json<HealthRes> {
    Json(HealthService::check_health())
}

#[utoipa::path(
    get,
    path = "/status",
    params(StatusQuery),
    responses(
        (status = 200, description = "Consent status for the tuple", body = StatusRes),
        (status = 400, description = "Missing or malformed parameter", body = ErrorBody)
    )
)]
/// Whether a provider currently holds consent for a category of a patient's data
///
/// The newest active, unexpired consent wins. With none, the newest active consent that has
/// expired is reported with `isExpired: true`.
///
/// # Errors
/// Returns `400 Bad Request` if:
/// - `patient`, `provider` or `dataCategory` is missing,
/// - a principal is malformed or the category is unknown.
#[axum::debug_handler]
async fn check_status(
    State(state): State<AppState>,
    Query(q): Query<StatusQuery>,
) -> ApiResult<StatusRes> {
    let patient = params::principal("patient", q.patient.as_deref())?;
    let provider = params::principal("provider", q.provider.as_deref())?;
    let category = params::data_category("dataCategory", q.data_category.as_deref())?;
    let status = state
        .core
        .queries()
        .check_status(&patient, &provider, category)
        .await?;
    Ok(Json(status.into()))
}

#[utoipa::path(
    get,
    path = "/consent/{id}",
    params(("id" = String, Path, description = "Consent id, 32 lowercase hex characters")),
    responses(
        (status = 200, description = "The consent record", body = ConsentRes),
        (status = 400, description = "Malformed id", body = ErrorBody),
        (status = 404, description = "No such consent", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn get_consent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ConsentRes> {
    let id = params::record_id(&id)?;
    Ok(Json(state.core.queries().get_consent(&id)?.into()))
}

#[utoipa::path(
    get,
    path = "/consents/patient/{patient}",
    params(("patient" = String, Path, description = "Patient principal"), ConsentListQuery),
    responses(
        (status = 200, description = "Consents granted by the patient, oldest first", body = ConsentListRes),
        (status = 400, description = "Malformed parameter", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn consents_for_patient(
    State(state): State<AppState>,
    Path(patient): Path<String>,
    Query(q): Query<ConsentListQuery>,
) -> ApiResult<ConsentListRes> {
    let patient = params::principal("patient", Some(patient.as_str()))?;
    let include_expired = params::flag("includeExpired", q.include_expired.as_deref())?;
    let consents = state
        .core
        .queries()
        .consents_for_patient(&patient, include_expired)
        .await?;
    Ok(Json(consents.into()))
}

#[utoipa::path(
    get,
    path = "/consents/provider/{provider}",
    params(("provider" = String, Path, description = "Provider principal"), ConsentListQuery),
    responses(
        (status = 200, description = "Consents held by the provider, oldest first", body = ConsentListRes),
        (status = 400, description = "Malformed parameter", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn consents_for_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<ConsentListQuery>,
) -> ApiResult<ConsentListRes> {
    let provider = params::principal("provider", Some(provider.as_str()))?;
    let include_expired = params::flag("includeExpired", q.include_expired.as_deref())?;
    let consents = state
        .core
        .queries()
        .consents_for_provider(&provider, include_expired)
        .await?;
    Ok(Json(consents.into()))
}

#[utoipa::path(
    get,
    path = "/requests/{id}",
    params(("id" = String, Path, description = "Request id, 32 lowercase hex characters")),
    responses(
        (status = 200, description = "The access request", body = RequestRes),
        (status = 400, description = "Malformed id", body = ErrorBody),
        (status = 404, description = "No such request", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<RequestRes> {
    let id = params::record_id(&id)?;
    Ok(Json(state.core.queries().get_request(&id)?.into()))
}

#[utoipa::path(
    get,
    path = "/requests/patient/{patient}",
    params(("patient" = String, Path, description = "Patient principal"), RequestListQuery),
    responses(
        (status = 200, description = "Requests addressed to the patient, oldest first", body = RequestListRes),
        (status = 400, description = "Malformed parameter", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn requests_for_patient(
    State(state): State<AppState>,
    Path(patient): Path<String>,
    Query(q): Query<RequestListQuery>,
) -> ApiResult<RequestListRes> {
    let patient = params::principal("patient", Some(patient.as_str()))?;
    let filter = params::request_filter(q.status.as_deref())?;
    let requests = state
        .core
        .queries()
        .requests_for_patient(&patient, filter)
        .await?;
    Ok(Json(requests.into()))
}

#[utoipa::path(
    get,
    path = "/requests/provider/{provider}",
    params(("provider" = String, Path, description = "Requesting provider"), RequestListQuery),
    responses(
        (status = 200, description = "Requests made by the provider, oldest first", body = RequestListRes),
        (status = 400, description = "Malformed parameter", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn requests_for_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(q): Query<RequestListQuery>,
) -> ApiResult<RequestListRes> {
    let provider = params::principal("provider", Some(provider.as_str()))?;
    let filter = params::request_filter(q.status.as_deref())?;
    let requests = state
        .core
        .queries()
        .requests_for_provider(&provider, filter)
        .await?;
    Ok(Json(requests.into()))
}

#[utoipa::path(
    get,
    path = "/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "Ledger events in the window, in sequence order", body = EventListRes),
        (status = 400, description = "Missing parameter or window out of bounds", body = ErrorBody),
        (status = 503, description = "Ledger unavailable", body = ErrorBody)
    )
)]
/// Raw ledger events for a bounded window
///
/// # Errors
/// Returns `400 Bad Request` if:
/// - `fromSeq` or `toSeq` is missing or not a number,
/// - `fromSeq` is 0 or greater than `toSeq`,
/// - the window exceeds the configured maximum.
#[axum::debug_handler]
async fn events(
    State(state): State<AppState>,
    Query(q): Query<EventsQuery>,
) -> ApiResult<EventListRes> {
    let principal = params::optional_principal(q.principal.as_deref())?;
    let from = params::sequence("fromSeq", q.from_seq.as_deref())?;
    let to = params::sequence("toSeq", q.to_seq.as_deref())?;
    let events = state
        .core
        .queries()
        .events(principal.as_ref(), from, to)
        .await?;
    Ok(Json(EventListRes::try_from(events)?))
}

#[utoipa::path(
    get,
    path = "/ledger/info",
    responses(
        (status = 200, description = "Ledger connectivity; unreachability is reported in the body", body = LedgerInfoRes)
    )
)]
#[axum::debug_handler]
async fn ledger_info(State(state): State<AppState>) -> Json<LedgerInfoRes> {
    Json(state.health.ledger_info().await)
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
