//! Test doubles shared by unit and integration tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consent_types::{DataCategory, Principal, Purpose, RecordId};

use crate::clock::ManualClock;
use crate::config::{CacheConfig, CoreConfig, RetryConfig};
use crate::event::{ConsentGranted, EventBody, LedgerEvent};
use crate::ledger::{EventFilter, LedgerBackend, LedgerError, LedgerResult, MemoryLedger};
use crate::ConsentCore;

/// Start time for tests that use a [`ManualClock`].
pub const T0: u64 = 1_700_000_000;

/// A `ConsentGranted` payload for `medical_records`/`treatment` that never expires.
pub fn granted(patient: &str, provider: &str) -> EventBody {
    EventBody::ConsentGranted(ConsentGranted {
        consent_id: RecordId::generate(),
        patient: principal(patient),
        provider: principal(provider),
        data_category: DataCategory::MedicalRecords,
        purpose: Purpose::Treatment,
        granted_at: T0,
        expiration_time: 0,
        request_id: None,
    })
}

/// Panics on invalid input; for fixtures only.
pub fn principal(value: &str) -> Principal {
    match Principal::new(value) {
        Ok(p) => p,
        Err(e) => panic!("invalid test principal '{}': {}", value, e),
    }
}

/// Config with millisecond retry backoff so failure tests run quickly.
pub fn fast_config(cache: CacheConfig) -> CoreConfig {
    let built = CoreConfig::builder()
        .retry(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
        .ledger_timeout(Duration::from_secs(2))
        .follow_interval(Duration::from_millis(10))
        .cache(cache)
        .build();
    match built {
        Ok(cfg) => cfg,
        Err(e) => panic!("invalid test config: {}", e),
    }
}

/// A core over a fresh [`MemoryLedger`] with a [`ManualClock`] at [`T0`].
pub fn memory_core(cache: CacheConfig) -> (ConsentCore, Arc<MemoryLedger>, Arc<ManualClock>) {
    let ledger = Arc::new(MemoryLedger::new());
    let clock = Arc::new(ManualClock::new(T0));
    let core = ConsentCore::new(
        Arc::new(fast_config(cache)),
        ledger.clone(),
        clock.clone(),
    );
    (core, ledger, clock)
}

/// Wraps a backend and injects transient failures or stalls on demand.
pub struct FlakyLedger<B> {
    inner: B,
    failures_left: AtomicU32,
    stall_ms: AtomicU64,
    calls: AtomicU32,
}

impl<B: LedgerBackend> FlakyLedger<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
            stall_ms: AtomicU64::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// The next `n` calls fail with [`LedgerError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Every call sleeps for `duration` before reaching the inner backend.
    pub fn stall_for(&self, duration: Duration) {
        self.stall_ms
            .store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn gate(&self) -> LedgerResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stall = self.stall_ms.load(Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: LedgerBackend> LedgerBackend for FlakyLedger<B> {
    async fn append(&self, batch: Vec<EventBody>) -> LedgerResult<Vec<LedgerEvent>> {
        self.gate().await?;
        self.inner.append(batch).await
    }

    async fn range(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> LedgerResult<Vec<LedgerEvent>> {
        self.gate().await?;
        self.inner.range(from, to, filter).await
    }

    async fn head(&self) -> LedgerResult<u64> {
        self.gate().await?;
        self.inner.head().await
    }

    fn describe(&self) -> String {
        format!("flaky({})", self.inner.describe())
    }
}
