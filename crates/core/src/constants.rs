//! Constants used throughout the consent core crate.
//!
//! Defaults for [`CoreConfig`](crate::config::CoreConfig) live here so the binaries, the CLI and
//! tests agree on them.

use std::time::Duration;

/// Default deadline applied to each ledger call, including all retries.
pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries after the first attempt for transient ledger failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on configurable retries.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Default initial backoff between ledger retries.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Default cap on the backoff between ledger retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Hard upper bound on the number of entries a single range call may cover.
pub const MAX_RANGE_WINDOW: u64 = 10_000;

/// Default time-to-live for status-check cache entries.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(30);

/// Default time-to-live for consent and request listing cache entries.
pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(300);

/// Default time-to-live for raw event-range cache entries.
pub const DEFAULT_RANGE_TTL: Duration = Duration::from_secs(600);

/// Minimum allowed cache TTL.
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(1);

/// Default maximum number of cache entries.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;

/// Default poll interval for following external ledger appends.
pub const DEFAULT_FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum poll interval for following external ledger appends.
pub const MIN_FOLLOW_INTERVAL: Duration = Duration::from_millis(10);

/// Deadline for the `ledger/info` probe.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default path of the development file-backed ledger.
pub const DEFAULT_LEDGER_PATH: &str = "consent_ledger.jsonl";
