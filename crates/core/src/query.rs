//! Read operations over the projection.
//!
//! Listings and status checks go through the [`ViewCache`](crate::cache::ViewCache). Record
//! lookups by id read the projection directly.

use std::sync::Arc;

use consent_types::{DataCategory, Principal, RecordId};
use serde::Serialize;

use crate::cache::{CacheKey, CachedView};
use crate::clock::Clock;
use crate::constants::HEALTH_PROBE_TIMEOUT;
use crate::event::LedgerEvent;
use crate::ledger::{check_window, EventFilter};
use crate::model::{ConsentView, RequestFilter, RequestView, Role, StatusCheck};
use crate::sync::Materializer;
use crate::{ConsentError, ConsentResult};

/// Connectivity report for the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LedgerInfo {
    pub reachable: bool,
    pub backend: String,
    pub head_sequence: Option<u64>,
    pub applied_sequence: u64,
    /// Events in the ledger not yet applied to the projection.
    pub lag: Option<u64>,
    pub message: String,
}

#[derive(Clone)]
pub struct QueryService {
    materializer: Arc<Materializer>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(materializer: Arc<Materializer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            materializer,
            clock,
        }
    }

    /// Whether `provider` currently holds consent for `category` of `patient`'s data.
    pub async fn check_status(
        &self,
        patient: &Principal,
        provider: &Principal,
        category: DataCategory,
    ) -> ConsentResult<StatusCheck> {
        let now = self.clock.now();
        let projection = self.materializer.projection();
        let key = CacheKey::Status {
            patient: patient.clone(),
            provider: provider.clone(),
            category,
        };
        let view = self
            .materializer
            .cache()
            .get_or_compute(key, &projection, now, || {
                CachedView::Status(projection.status(patient, provider, category, now))
            })
            .await;
        match view {
            CachedView::Status(status) => Ok(status),
            other => Err(mismatch("status", &other)),
        }
    }

    pub fn get_consent(&self, id: &RecordId) -> ConsentResult<ConsentView> {
        let record = self
            .materializer
            .projection()
            .consent(id)
            .ok_or(ConsentError::ConsentNotFound(*id))?;
        Ok(ConsentView::at(record, self.clock.now()))
    }

    pub async fn consents_for_patient(
        &self,
        patient: &Principal,
        include_expired: bool,
    ) -> ConsentResult<Vec<ConsentView>> {
        self.consents(Role::Patient, patient, include_expired).await
    }

    pub async fn consents_for_provider(
        &self,
        provider: &Principal,
        include_expired: bool,
    ) -> ConsentResult<Vec<ConsentView>> {
        self.consents(Role::Provider, provider, include_expired).await
    }

    pub fn get_request(&self, id: &RecordId) -> ConsentResult<RequestView> {
        let request = self
            .materializer
            .projection()
            .request(id)
            .ok_or(ConsentError::RequestNotFound(*id))?;
        Ok(RequestView::at(request, self.clock.now()))
    }

    pub async fn requests_for_patient(
        &self,
        patient: &Principal,
        filter: RequestFilter,
    ) -> ConsentResult<Vec<RequestView>> {
        self.requests(Role::Patient, patient, filter).await
    }

    pub async fn requests_for_provider(
        &self,
        provider: &Principal,
        filter: RequestFilter,
    ) -> ConsentResult<Vec<RequestView>> {
        self.requests(Role::Provider, provider, filter).await
    }

    /// Events in `from..=to`, optionally only those involving `principal`.
    ///
    /// Windows already applied to the projection are served from its history and cached.
    /// Anything newer is read from the ledger.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for `from == 0` or `from > to`, `RangeTooLarge` for windows wider than the
    /// configured maximum, and ledger errors for windows read from the ledger.
    pub async fn events(
        &self,
        principal: Option<&Principal>,
        from: u64,
        to: u64,
    ) -> ConsentResult<Vec<LedgerEvent>> {
        let ledger = self.materializer.ledger();
        check_window(from, to, ledger.max_window())?;

        let projection = self.materializer.projection();
        if to > projection.watermark() {
            let filter = EventFilter {
                principal: principal.cloned(),
            };
            return ledger.range(from, to, &filter).await;
        }

        let key = CacheKey::Events {
            principal: principal.cloned(),
            from,
            to,
        };
        let view = self
            .materializer
            .cache()
            .get_or_compute(key, &projection, self.clock.now(), || {
                CachedView::Events(Arc::new(projection.history(principal, from, to)))
            })
            .await;
        match view {
            CachedView::Events(events) => Ok(Arc::unwrap_or_clone(events)),
            other => Err(mismatch("events", &other)),
        }
    }

    /// Probes the ledger with a short deadline. Never fails; unreachability is reported in the
    /// result.
    pub async fn ledger_info(&self) -> LedgerInfo {
        let ledger = self.materializer.ledger();
        let applied_sequence = self.materializer.projection().watermark();
        match ledger.with_deadline(HEALTH_PROBE_TIMEOUT).head().await {
            Ok(head) => LedgerInfo {
                reachable: true,
                backend: ledger.describe(),
                head_sequence: Some(head),
                applied_sequence,
                lag: Some(head.saturating_sub(applied_sequence)),
                message: "ledger reachable".into(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "ledger probe failed");
                LedgerInfo {
                    reachable: false,
                    backend: ledger.describe(),
                    head_sequence: None,
                    applied_sequence,
                    lag: None,
                    message: e.public_message(),
                }
            }
        }
    }

    async fn consents(
        &self,
        role: Role,
        principal: &Principal,
        include_expired: bool,
    ) -> ConsentResult<Vec<ConsentView>> {
        let now = self.clock.now();
        let projection = self.materializer.projection();
        let key = CacheKey::Consents {
            role,
            principal: principal.clone(),
            include_expired,
        };
        let view = self
            .materializer
            .cache()
            .get_or_compute(key, &projection, now, || {
                CachedView::Consents(Arc::new(projection.consents_for(
                    role,
                    principal,
                    include_expired,
                    now,
                )))
            })
            .await;
        match view {
            CachedView::Consents(items) => Ok(Arc::unwrap_or_clone(items)),
            other => Err(mismatch("consents", &other)),
        }
    }

    async fn requests(
        &self,
        role: Role,
        principal: &Principal,
        filter: RequestFilter,
    ) -> ConsentResult<Vec<RequestView>> {
        let now = self.clock.now();
        let projection = self.materializer.projection();
        let key = CacheKey::Requests {
            role,
            principal: principal.clone(),
            filter,
        };
        let view = self
            .materializer
            .cache()
            .get_or_compute(key, &projection, now, || {
                CachedView::Requests(Arc::new(projection.requests_for(role, principal, filter, now)))
            })
            .await;
        match view {
            CachedView::Requests(items) => Ok(Arc::unwrap_or_clone(items)),
            other => Err(mismatch("requests", &other)),
        }
    }
}

fn mismatch(expected: &str, view: &CachedView) -> ConsentError {
    ConsentError::Internal(format!(
        "view cache returned a {} view for a {} key",
        view.kind(),
        expected
    ))
}
