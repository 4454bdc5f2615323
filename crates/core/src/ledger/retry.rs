//! Retry with deadline for ledger calls.
//!
//! Transient errors ([`LedgerError::is_transient`]) are retried with exponential backoff plus
//! jitter: `min(initial_backoff * 2^attempt, max_backoff) + random(0..=50%)`. Other errors return
//! immediately. The whole loop, sleeps included, runs under one deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use super::{LedgerError, LedgerResult};
use crate::config::RetryConfig;

/// Progress of a retry loop, read by the deadline handler when it fires.
#[derive(Debug, Default)]
struct RetryState {
    attempts_completed: u32,
    last_error: Option<String>,
}

async fn with_retry_tracked<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    state: Arc<Mutex<RetryState>>,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let mut last_error: Option<LedgerError> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "ledger call succeeded after retry",
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                let delay = compute_backoff(config, attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient ledger error, retrying after backoff",
                );
                {
                    let mut s = state.lock();
                    s.attempts_completed = attempt + 1;
                    s.last_error = Some(err.to_string());
                }
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    operation = operation_name,
                    attempts = attempt + 1,
                    error = %err,
                    "ledger retries exhausted",
                );
                return Err(LedgerError::Exhausted {
                    attempts: attempt + 1,
                    last: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    Err(LedgerError::Exhausted {
        attempts: config.max_retries + 1,
        last: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Executes `operation` with retry, bounding total wall-clock time by `timeout`.
///
/// When the deadline fires the in-flight attempt is dropped and
/// [`LedgerError::Timeout`] reports how many attempts had completed.
#[tracing::instrument(skip(config, operation), fields(timeout_ms = timeout.as_millis() as u64))]
pub(crate) async fn with_retry_timeout<F, Fut, T>(
    config: &RetryConfig,
    timeout: Duration,
    operation_name: &str,
    operation: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let state = Arc::new(Mutex::new(RetryState::default()));

    match tokio::time::timeout(
        timeout,
        with_retry_tracked(config, operation_name, operation, Arc::clone(&state)),
    )
    .await
    {
        Ok(result) => result,
        Err(_elapsed) => {
            let s = state.lock();
            tracing::warn!(
                operation = operation_name,
                attempts = s.attempts_completed,
                last_error = s.last_error.as_deref().unwrap_or("none"),
                "ledger call exceeded deadline",
            );
            Err(LedgerError::Timeout {
                attempts: s.attempts_completed,
            })
        }
    }
}

fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config
        .initial_backoff
        .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = base.min(config.max_backoff);

    let jitter_range = capped.as_millis() as u64 / 2;
    if jitter_range > 0 {
        let jitter = rand::thread_rng().gen_range(0..=jitter_range);
        capped + Duration::from_millis(jitter)
    } else {
        capped
    }
}
