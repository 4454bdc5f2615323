//! # View cache
//!
//! Read-through cache in front of the [`ProjectionEngine`], backed by [`moka::future::Cache`].
//!
//! Entries are keyed by query shape: status tuple, consent or request listing, or event window.
//! Each key class has its own TTL. Concurrent misses for one key share a single computation.
//!
//! An entry is served only while it is provably current:
//!
//! - its `stamp` (the projection watermark sampled before computing) is at least the last
//!   sequence that touched the key's [`ViewScope`], and
//! - the clock is before its `valid_until`, the earliest future expiration among the records it
//!   holds.
//!
//! The first rule makes a revoke visible as soon as the projection applies it, whatever the TTL.
//! The second stops a consent being reported as authorising once its expiration time passes.
//! Event windows are immutable once below the watermark and carry no scope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use consent_types::{DataCategory, Principal};
use moka::future::Cache;

use crate::config::CacheConfig;
use crate::event::LedgerEvent;
use crate::model::{ConsentView, RequestFilter, RequestView, Role, StatusCheck, NEVER_EXPIRES};
use crate::projection::{ProjectionEngine, ViewScope};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Status {
        patient: Principal,
        provider: Principal,
        category: DataCategory,
    },
    Consents {
        role: Role,
        principal: Principal,
        include_expired: bool,
    },
    Requests {
        role: Role,
        principal: Principal,
        filter: RequestFilter,
    },
    Events {
        principal: Option<Principal>,
        from: u64,
        to: u64,
    },
}

impl CacheKey {
    /// The projection scope whose changes make this entry stale. Event windows have none.
    pub fn scope(&self) -> Option<ViewScope> {
        match self {
            CacheKey::Status {
                patient,
                provider,
                category,
            } => Some(ViewScope::Status {
                patient: patient.clone(),
                provider: provider.clone(),
                category: *category,
            }),
            CacheKey::Consents {
                role, principal, ..
            } => Some(ViewScope::Consents {
                role: *role,
                principal: principal.clone(),
            }),
            CacheKey::Requests {
                role, principal, ..
            } => Some(ViewScope::Requests {
                role: *role,
                principal: principal.clone(),
            }),
            CacheKey::Events { .. } => None,
        }
    }

    fn ttl(&self, config: &CacheConfig) -> Duration {
        match self {
            CacheKey::Status { .. } => config.status_ttl,
            CacheKey::Consents { .. } | CacheKey::Requests { .. } => config.listing_ttl,
            CacheKey::Events { .. } => config.range_ttl,
        }
    }
}

/// Every key that can hold data derived from `scope`.
fn keys_in(scope: &ViewScope) -> Vec<CacheKey> {
    match scope {
        ViewScope::Status {
            patient,
            provider,
            category,
        } => vec![CacheKey::Status {
            patient: patient.clone(),
            provider: provider.clone(),
            category: *category,
        }],
        ViewScope::Consents { role, principal } => [false, true]
            .into_iter()
            .map(|include_expired| CacheKey::Consents {
                role: *role,
                principal: principal.clone(),
                include_expired,
            })
            .collect(),
        ViewScope::Requests { role, principal } => RequestFilter::ALL_FILTERS
            .into_iter()
            .map(|filter| CacheKey::Requests {
                role: *role,
                principal: principal.clone(),
                filter,
            })
            .collect(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CachedView {
    Status(StatusCheck),
    Consents(Arc<Vec<ConsentView>>),
    Requests(Arc<Vec<RequestView>>),
    Events(Arc<Vec<LedgerEvent>>),
}

impl CachedView {
    pub fn kind(&self) -> &'static str {
        match self {
            CachedView::Status(_) => "status",
            CachedView::Consents(_) => "consents",
            CachedView::Requests(_) => "requests",
            CachedView::Events(_) => "events",
        }
    }

    /// Earliest expiration after `now` among the records in this view.
    fn valid_until(&self, now: u64) -> Option<u64> {
        let upcoming = |exp: u64| exp != NEVER_EXPIRES && exp > now;
        match self {
            CachedView::Status(s) => s.expiration_time.filter(|exp| upcoming(*exp)),
            CachedView::Consents(items) => items
                .iter()
                .map(|v| v.record.expiration_time)
                .filter(|exp| upcoming(*exp))
                .min(),
            CachedView::Requests(items) => items
                .iter()
                .map(|v| v.request.expiration_time)
                .filter(|exp| upcoming(*exp))
                .min(),
            CachedView::Events(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    view: CachedView,
    stamp: u64,
    valid_until: Option<u64>,
    ttl: Duration,
}

impl Entry {
    fn is_fresh(&self, scope_version: u64, now: u64) -> bool {
        self.stamp >= scope_version && self.valid_until.map_or(true, |t| now < t)
    }
}

struct EntryExpiry;

impl moka::Expiry<CacheKey, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct ViewCache {
    config: CacheConfig,
    entries: Option<Cache<CacheKey, Entry>>,
}

impl ViewCache {
    pub fn new(config: &CacheConfig) -> Self {
        let entries = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .expire_after(EntryExpiry)
                .build()
        });
        Self {
            config: config.clone(),
            entries,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Returns the cached view for `key`, or computes it with `compute`.
    ///
    /// Concurrent callers missing on the same key wait for one computation. If the shared result
    /// turns out to be stale because a write landed while it was computed, this caller computes
    /// directly instead of serving it.
    pub async fn get_or_compute<F>(
        &self,
        key: CacheKey,
        projection: &ProjectionEngine,
        now: u64,
        compute: F,
    ) -> CachedView
    where
        F: Fn() -> CachedView,
    {
        let Some(entries) = &self.entries else {
            return compute();
        };
        let scope_version = key
            .scope()
            .map(|scope| projection.scope_version(&scope))
            .unwrap_or(0);

        if let Some(entry) = entries.get(&key).await {
            if entry.is_fresh(scope_version, now) {
                tracing::trace!(?key, "view cache hit");
                return entry.view;
            }
            entries.invalidate(&key).await;
        }

        let ttl = key.ttl(&self.config);
        let entry = entries
            .get_with(key.clone(), async {
                let stamp = projection.watermark();
                let view = compute();
                let valid_until = view.valid_until(now);
                Entry {
                    view,
                    stamp,
                    valid_until,
                    ttl,
                }
            })
            .await;

        let scope_version = key
            .scope()
            .map(|scope| projection.scope_version(&scope))
            .unwrap_or(0);
        if entry.is_fresh(scope_version, now) {
            return entry.view;
        }
        tracing::debug!(?key, "shared view was stale, computing directly");
        entries.invalidate(&key).await;
        compute()
    }

    /// Drops every entry derived from `scopes`.
    pub async fn invalidate_scopes(&self, scopes: &[ViewScope]) {
        let Some(entries) = &self.entries else {
            return;
        };
        for scope in scopes {
            for key in keys_in(scope) {
                entries.invalidate(&key).await;
            }
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.invalidate_all();
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.as_ref().map_or(0, |e| e.entry_count())
    }
}
