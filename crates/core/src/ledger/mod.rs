//! Ledger Client.
//!
//! The only code that talks to the external ordered log. [`LedgerBackend`] is the seam for the
//! substrate (in-memory, file, or a remote service); [`LedgerClient`] wraps any backend with a
//! per-call deadline, bounded exponential-backoff retry and range-window enforcement. It holds no
//! business logic.

mod file;
mod memory;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consent_types::Principal;

use crate::config::{CoreConfig, RetryConfig};
use crate::event::{EventBody, LedgerEvent};
use crate::{ConsentError, ConsentResult};

pub use file::FileLedger;
pub use memory::MemoryLedger;

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// Connectivity failure; the call had no effect and may be retried.
    #[error("ledger unreachable: {0}")]
    Unavailable(String),
    /// The deadline elapsed before the call (including retries) completed.
    #[error("ledger call exceeded its deadline after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    /// Transient failures persisted through every retry.
    #[error("ledger unavailable after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
    /// The ledger refused the call.
    #[error("ledger rejected call: {0}")]
    Rejected(String),
    /// The log content is malformed or not contiguous.
    #[error("ledger data corrupt: {0}")]
    Corrupt(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Optional narrowing of a range read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventFilter {
    /// Only events where this principal is the patient or the provider/requester.
    pub principal: Option<Principal>,
}

impl EventFilter {
    pub fn principal(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
        }
    }

    pub fn matches(&self, event: &LedgerEvent) -> bool {
        match &self.principal {
            Some(p) => event.body.involves(p),
            None => true,
        }
    }
}

/// An ordered, append-only event log.
///
/// Sequences start at 1 and are contiguous. `append` is atomic: either every event in the batch
/// is recorded with consecutive sequences, or none is. Implementations must only return
/// [`LedgerError::Unavailable`] when the batch was not recorded, so a retried append can never
/// duplicate events.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn append(&self, batch: Vec<EventBody>) -> LedgerResult<Vec<LedgerEvent>>;

    /// Events with `from <= sequence <= to` that match `filter`, in sequence order.
    async fn range(&self, from: u64, to: u64, filter: &EventFilter)
        -> LedgerResult<Vec<LedgerEvent>>;

    /// Sequence of the last recorded event, or 0 for an empty log.
    async fn head(&self) -> LedgerResult<u64>;

    /// Short human-readable description of the substrate.
    fn describe(&self) -> String;
}

/// Retrying, deadline-bounded access to a [`LedgerBackend`].
///
/// Cloning is cheap; clones share the backend.
#[derive(Clone)]
pub struct LedgerClient {
    backend: Arc<dyn LedgerBackend>,
    retry: RetryConfig,
    timeout: Duration,
    max_window: u64,
}

impl LedgerClient {
    pub fn new(backend: Arc<dyn LedgerBackend>, cfg: &CoreConfig) -> Self {
        Self {
            backend,
            retry: cfg.retry().clone(),
            timeout: cfg.ledger_timeout(),
            max_window: cfg.max_range_window(),
        }
    }

    /// A client sharing this backend whose calls use `deadline` instead of the configured
    /// timeout.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            timeout: deadline,
            ..self.clone()
        }
    }

    pub fn max_window(&self) -> u64 {
        self.max_window
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    /// Appends `batch` atomically and returns the recorded events.
    #[tracing::instrument(skip(self, batch), fields(events = batch.len()))]
    pub async fn append(&self, batch: Vec<EventBody>) -> ConsentResult<Vec<LedgerEvent>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let backend = &self.backend;
        let events = retry::with_retry_timeout(&self.retry, self.timeout, "append", || {
            let batch = batch.clone();
            async move { backend.append(batch).await }
        })
        .await?;

        let expected = batch.len();
        if events.len() != expected || !is_contiguous(&events) {
            return Err(ConsentError::LedgerCorrupt(format!(
                "append of {} event(s) returned {} non-contiguous record(s)",
                expected,
                events.len()
            )));
        }
        tracing::debug!(
            first = events.first().map(|e| e.sequence),
            last = events.last().map(|e| e.sequence),
            "appended events"
        );
        Ok(events)
    }

    /// Reads `from..=to`, rejecting windows wider than the configured maximum.
    #[tracing::instrument(skip(self, filter))]
    pub async fn range(
        &self,
        from: u64,
        to: u64,
        filter: &EventFilter,
    ) -> ConsentResult<Vec<LedgerEvent>> {
        check_window(from, to, self.max_window)?;
        let backend = &self.backend;
        let events = retry::with_retry_timeout(&self.retry, self.timeout, "range", || async move {
            backend.range(from, to, filter).await
        })
        .await?;
        Ok(events)
    }

    pub async fn head(&self) -> ConsentResult<u64> {
        let backend = &self.backend;
        let head = retry::with_retry_timeout(&self.retry, self.timeout, "head", || async move {
            backend.head().await
        })
        .await?;
        Ok(head)
    }
}

/// Validates a `from..=to` sequence window.
pub fn check_window(from: u64, to: u64, max: u64) -> ConsentResult<()> {
    if from == 0 {
        return Err(ConsentError::InvalidInput(
            "fromSeq must be at least 1".into(),
        ));
    }
    if from > to {
        return Err(ConsentError::InvalidInput(format!(
            "fromSeq ({}) must not exceed toSeq ({})",
            from, to
        )));
    }
    if to - from >= max {
        return Err(ConsentError::RangeTooLarge { from, to, max });
    }
    Ok(())
}

fn is_contiguous(events: &[LedgerEvent]) -> bool {
    events
        .windows(2)
        .all(|pair| pair[1].sequence == pair[0].sequence + 1)
}
