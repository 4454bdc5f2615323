//! Keeps the projection in step with the ledger.
//!
//! The [`Materializer`] owns the live [`ProjectionEngine`] and the [`ViewCache`] in front of it.
//! Every event reaches the projection through here, so the scopes it touches are invalidated in
//! the same step that applies it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::cache::ViewCache;
use crate::event::LedgerEvent;
use crate::ledger::{EventFilter, LedgerClient};
use crate::projection::{ApplyOutcome, ProjectionEngine};
use crate::{ConsentError, ConsentResult};

pub struct Materializer {
    ledger: LedgerClient,
    projection: RwLock<Arc<ProjectionEngine>>,
    cache: Arc<ViewCache>,
    sync: tokio::sync::Mutex<()>,
}

impl Materializer {
    pub fn new(ledger: LedgerClient, cache: Arc<ViewCache>) -> Self {
        Self {
            ledger,
            projection: RwLock::new(Arc::new(ProjectionEngine::new())),
            cache,
            sync: tokio::sync::Mutex::new(()),
        }
    }

    /// The projection currently serving reads.
    pub fn projection(&self) -> Arc<ProjectionEngine> {
        Arc::clone(&self.projection.read())
    }

    pub fn cache(&self) -> &ViewCache {
        &self.cache
    }

    pub fn ledger(&self) -> &LedgerClient {
        &self.ledger
    }

    /// Applies every ledger event past the watermark. Returns how many were applied.
    ///
    /// Safe to call again after a failure: paging resumes from the watermark.
    pub async fn catch_up(&self) -> ConsentResult<u64> {
        let _guard = self.sync.lock().await;
        let projection = self.projection();
        self.pull(&projection, true).await
    }

    /// Applies events this process just appended.
    ///
    /// If they are ahead of the watermark (another writer appended in between), the projection
    /// catches up from the ledger first. Already applied events are skipped.
    pub async fn ingest(&self, events: &[LedgerEvent]) -> ConsentResult<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let _guard = self.sync.lock().await;
        let projection = self.projection();
        if first.sequence > projection.watermark() + 1 {
            tracing::debug!(
                watermark = projection.watermark(),
                first = first.sequence,
                "appended events are ahead of the projection, catching up"
            );
            self.pull(&projection, true).await?;
        }
        for event in events {
            self.apply(&projection, event, true).await?;
        }
        Ok(())
    }

    /// Replays the whole ledger into a fresh projection and swaps it in.
    ///
    /// Reads keep using the old projection until the replay finishes. The cache is cleared after
    /// the swap.
    pub async fn rebuild(&self) -> ConsentResult<u64> {
        let _guard = self.sync.lock().await;
        let fresh = Arc::new(ProjectionEngine::new());
        let applied = self.pull(&fresh, false).await?;
        *self.projection.write() = fresh;
        self.cache.clear();
        tracing::info!(
            applied,
            ledger = %self.ledger.describe(),
            "projection rebuilt from ledger"
        );
        Ok(applied)
    }

    /// Starts a task that calls [`catch_up`](Self::catch_up) every `interval` so appends from
    /// other writers become visible. Failures are logged and retried on the next tick.
    pub fn spawn_follower(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.catch_up().await {
                    Ok(0) => {}
                    Ok(applied) => tracing::debug!(applied, "follower applied new events"),
                    Err(e) => tracing::warn!(error = %e, "follower catch-up failed"),
                }
            }
        })
    }

    async fn pull(&self, projection: &ProjectionEngine, invalidate: bool) -> ConsentResult<u64> {
        let head = self.ledger.head().await?;
        let window = self.ledger.max_window();
        let mut applied = 0;

        while projection.watermark() < head {
            let from = projection.watermark() + 1;
            let to = head.min(from + window - 1);
            let page = self
                .ledger
                .range(from, to, &EventFilter::default())
                .await?;
            match page.first() {
                Some(first) if first.sequence == from => {}
                Some(first) => {
                    return Err(ConsentError::LedgerCorrupt(format!(
                        "range from {} started at sequence {}",
                        from, first.sequence
                    )))
                }
                None => {
                    return Err(ConsentError::LedgerCorrupt(format!(
                        "head is {} but range from {} is empty",
                        head, from
                    )))
                }
            }
            for event in &page {
                if self.apply(projection, event, invalidate).await? {
                    applied += 1;
                }
            }
            tracing::trace!(from, to, watermark = projection.watermark(), "applied page");
        }
        Ok(applied)
    }

    async fn apply(
        &self,
        projection: &ProjectionEngine,
        event: &LedgerEvent,
        invalidate: bool,
    ) -> ConsentResult<bool> {
        match projection.apply(event)? {
            ApplyOutcome::Applied(scopes) => {
                if invalidate {
                    self.cache.invalidate_scopes(&scopes).await;
                }
                tracing::debug!(
                    sequence = event.sequence,
                    kind = ?event.body.kind(),
                    "applied event"
                );
                Ok(true)
            }
            ApplyOutcome::Duplicate => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::ledger::{LedgerBackend, MemoryLedger};
    use crate::testutil::{fast_config, granted, FlakyLedger};

    fn materializer(
        backend: Arc<dyn LedgerBackend>,
        max_window: u64,
    ) -> (Materializer, LedgerClient) {
        let cfg = crate::config::CoreConfig::builder()
            .retry(fast_config(CacheConfig::default()).retry().clone())
            .max_range_window(max_window)
            .build()
            .unwrap();
        let client = LedgerClient::new(backend, &cfg);
        let cache = Arc::new(ViewCache::new(cfg.cache()));
        (Materializer::new(client.clone(), cache), client)
    }

    #[tokio::test]
    async fn test_catch_up_pages_through_small_windows() {
        let ledger = Arc::new(MemoryLedger::new());
        let batch = (0..7).map(|i| granted("P1", &format!("Q{}", i))).collect();
        ledger.append(batch).await.unwrap();

        let (m, _) = materializer(ledger, 3);
        assert_eq!(m.catch_up().await.unwrap(), 7);
        assert_eq!(m.projection().watermark(), 7);
        assert_eq!(m.catch_up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_catch_up_resumes_after_failure() {
        let ledger = Arc::new(FlakyLedger::new(MemoryLedger::new()));
        ledger
            .inner()
            .append(vec![granted("P1", "Q1"), granted("P1", "Q2")])
            .await
            .unwrap();
        let (m, _) = materializer(ledger.clone(), 10);
        m.catch_up().await.unwrap();

        ledger.inner().append(vec![granted("P2", "Q1")]).await.unwrap();
        ledger.fail_next(10);
        assert!(m.catch_up().await.is_err());
        assert_eq!(m.projection().watermark(), 2);

        ledger.fail_next(0);
        assert_eq!(m.catch_up().await.unwrap(), 1);
        assert_eq!(m.projection().watermark(), 3);
    }

    #[tokio::test]
    async fn test_ingest_catches_up_when_ahead() {
        let ledger = Arc::new(MemoryLedger::new());
        let (m, client) = materializer(ledger.clone(), 10);

        // Written by someone else; not yet seen.
        ledger.append(vec![granted("P1", "Q1")]).await.unwrap();
        let ours = client.append(vec![granted("P1", "Q2")]).await.unwrap();

        m.ingest(&ours).await.unwrap();
        assert_eq!(m.projection().watermark(), 2);
        assert_eq!(m.projection().consent_count(), 2);

        // Replaying what is already applied changes nothing.
        m.ingest(&ours).await.unwrap();
        assert_eq!(m.projection().consent_count(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_swaps_in_fresh_projection() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .append(vec![granted("P1", "Q1"), granted("P2", "Q2")])
            .await
            .unwrap();
        let (m, _) = materializer(ledger, 10);
        m.catch_up().await.unwrap();
        let before = m.projection();

        assert_eq!(m.rebuild().await.unwrap(), 2);
        let after = m.projection();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.snapshot(), after.snapshot());
    }

    #[tokio::test]
    async fn test_follower_picks_up_external_appends() {
        let ledger = Arc::new(MemoryLedger::new());
        let (m, _) = materializer(ledger.clone(), 10);
        let m = Arc::new(m);
        let follower = Arc::clone(&m).spawn_follower(Duration::from_millis(10));

        ledger.append(vec![granted("P1", "Q1")]).await.unwrap();
        let mut seen = false;
        for _ in 0..100 {
            if m.projection().watermark() == 1 {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        follower.abort();
        assert!(seen);
    }
}
