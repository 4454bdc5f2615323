//! # Consent Core
//!
//! Core logic for the consent authorization ledger.
//!
//! Patients grant providers access to categories of their data for stated purposes; providers
//! request access and patients approve or deny. Every change is an event in an external,
//! strictly ordered ledger. This crate contains:
//! - the ledger client (retry, deadline and window enforcement over a [`LedgerBackend`]),
//! - the authorization state machine that validates operations and appends events,
//! - the projection engine that folds events into query views,
//! - the view cache with request coalescing and write-driven invalidation,
//! - the typed query operations.
//!
//! **No API concerns**: HTTP servers and boundary types belong in `api-rest` and `api-shared`.

pub mod authorization;
pub mod cache;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod ledger;
pub mod model;
pub mod projection;
pub mod query;
mod sharded;
pub mod sync;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use authorization::{Approval, AuthorizationService};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CoreConfig, RetryConfig};
pub use error::{ConsentError, ConsentResult, ErrorCode};
pub use event::{EventBody, EventKind, LedgerEvent};
pub use ledger::{FileLedger, LedgerBackend, LedgerClient, MemoryLedger};
pub use model::{
    AccessRequest, ConsentRecord, ConsentView, RequestFilter, RequestStatus, RequestView, Role,
    StatusCheck,
};
pub use query::{LedgerInfo, QueryService};

use cache::ViewCache;
use sync::Materializer;

/// The ledger client, projection, cache and services wired together.
///
/// Each `ConsentCore` owns its own projection and cache.
#[derive(Clone)]
pub struct ConsentCore {
    cfg: Arc<CoreConfig>,
    materializer: Arc<Materializer>,
    authorization: AuthorizationService,
    queries: QueryService,
}

impl ConsentCore {
    pub fn new(cfg: Arc<CoreConfig>, backend: Arc<dyn LedgerBackend>, clock: Arc<dyn Clock>) -> Self {
        let ledger = LedgerClient::new(backend, &cfg);
        let cache = Arc::new(ViewCache::new(cfg.cache()));
        let materializer = Arc::new(Materializer::new(ledger, cache));
        let authorization =
            AuthorizationService::new(cfg.clone(), materializer.clone(), clock.clone());
        let queries = QueryService::new(materializer.clone(), clock);
        Self {
            cfg,
            materializer,
            authorization,
            queries,
        }
    }

    pub fn authorization(&self) -> &AuthorizationService {
        &self.authorization
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Replays the ledger into the projection. Call once before serving reads.
    pub async fn start(&self) -> ConsentResult<u64> {
        self.materializer.rebuild().await
    }

    /// Follows appends made by other writers at the configured interval.
    pub fn spawn_follower(&self) -> JoinHandle<()> {
        Arc::clone(&self.materializer).spawn_follower(self.cfg.follow_interval())
    }
}
