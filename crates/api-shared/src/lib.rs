//! # API Shared
//!
//! Boundary definitions for the consent ledger's query APIs.
//!
//! Contains:
//! - JSON response types with OpenAPI schemas (`dto` module)
//! - The error body every failed request returns
//! - Query-parameter parsing into validated core types (`params` module)
//! - `HealthService` for liveness and ledger connectivity
//!
//! Used by `api-rest` and the `consent` CLI so both render the same shapes.

pub mod dto;
pub mod health;
pub mod params;

pub use dto::*;
pub use health::HealthService;
