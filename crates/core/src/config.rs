//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services. Services never read environment variables during request
//! handling; the binaries read them and hand the raw values to the `*_from_env_value` helpers.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_FOLLOW_INTERVAL, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_LEDGER_TIMEOUT, DEFAULT_LISTING_TTL, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
    DEFAULT_RANGE_TTL, DEFAULT_STATUS_TTL, MAX_RANGE_WINDOW, MAX_RETRIES_LIMIT, MIN_CACHE_TTL,
    MIN_FOLLOW_INTERVAL,
};
use crate::{ConsentError, ConsentResult};

/// Retry policy for transient ledger failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// TTLs and sizing for the view cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: u64,
    pub status_ttl: Duration,
    pub listing_ttl: Duration,
    pub range_ttl: Duration,
}

impl CacheConfig {
    /// A configuration with caching turned off; every read goes to the projection.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            status_ttl: DEFAULT_STATUS_TTL,
            listing_ttl: DEFAULT_LISTING_TTL,
            range_ttl: DEFAULT_RANGE_TTL,
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    ledger_timeout: Duration,
    retry: RetryConfig,
    max_range_window: u64,
    cache: CacheConfig,
    follow_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ledger_timeout: DEFAULT_LEDGER_TIMEOUT,
            retry: RetryConfig::default(),
            max_range_window: MAX_RANGE_WINDOW,
            cache: CacheConfig::default(),
            follow_interval: DEFAULT_FOLLOW_INTERVAL,
        }
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder {
            cfg: CoreConfig::default(),
        }
    }

    pub fn ledger_timeout(&self) -> Duration {
        self.ledger_timeout
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn max_range_window(&self) -> u64 {
        self.max_range_window
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.cache
    }

    pub fn follow_interval(&self) -> Duration {
        self.follow_interval
    }
}

/// Builder for [`CoreConfig`].
#[derive(Clone, Debug)]
pub struct CoreConfigBuilder {
    cfg: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn ledger_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.ledger_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.cfg.retry = retry;
        self
    }

    pub fn max_range_window(mut self, window: u64) -> Self {
        self.cfg.max_range_window = window;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cfg.cache = cache;
        self
    }

    pub fn follow_interval(mut self, interval: Duration) -> Self {
        self.cfg.follow_interval = interval;
        self
    }

    /// Builds the [`CoreConfig`], validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::InvalidConfig`] if any field is out of range.
    pub fn build(self) -> ConsentResult<CoreConfig> {
        let cfg = self.cfg;

        if cfg.ledger_timeout.is_zero() {
            return Err(invalid("ledger_timeout must be at least 1ms"));
        }
        if cfg.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConsentError::InvalidConfig(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }
        if cfg.retry.initial_backoff.is_zero() {
            return Err(invalid("initial_backoff must be greater than zero"));
        }
        if cfg.retry.max_backoff < cfg.retry.initial_backoff {
            return Err(invalid("max_backoff must not be below initial_backoff"));
        }
        if cfg.max_range_window == 0 || cfg.max_range_window > MAX_RANGE_WINDOW {
            return Err(ConsentError::InvalidConfig(format!(
                "max_range_window must be between 1 and {}",
                MAX_RANGE_WINDOW
            )));
        }
        if cfg.cache.enabled {
            if cfg.cache.max_entries == 0 {
                return Err(invalid("cache max_entries must be at least 1"));
            }
            let ttls = [
                cfg.cache.status_ttl,
                cfg.cache.listing_ttl,
                cfg.cache.range_ttl,
            ];
            if ttls.iter().any(|ttl| *ttl < MIN_CACHE_TTL) {
                return Err(invalid("cache TTLs must be at least 1s"));
            }
        }
        if cfg.follow_interval < MIN_FOLLOW_INTERVAL {
            return Err(invalid("follow_interval must be at least 10ms"));
        }

        Ok(cfg)
    }
}

fn invalid(msg: &str) -> ConsentError {
    ConsentError::InvalidConfig(msg.to_owned())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a whole number from an optional environment value.
///
/// `None` or blank returns `default`.
pub fn u64_from_env_value(name: &str, value: Option<String>, default: u64) -> ConsentResult<u64> {
    match non_blank(value) {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| ConsentError::InvalidConfig(format!("{name} must be a whole number, got '{v}'"))),
    }
}

/// Parse a millisecond duration from an optional environment value.
pub fn millis_from_env_value(
    name: &str,
    value: Option<String>,
    default: Duration,
) -> ConsentResult<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    u64_from_env_value(name, value, default_ms).map(Duration::from_millis)
}

/// Parse a second duration from an optional environment value.
pub fn secs_from_env_value(
    name: &str,
    value: Option<String>,
    default: Duration,
) -> ConsentResult<Duration> {
    u64_from_env_value(name, value, default.as_secs()).map(Duration::from_secs)
}

/// Parse a boolean flag (`true`/`false`/`1`/`0`) from an optional environment value.
pub fn bool_from_env_value(name: &str, value: Option<String>, default: bool) -> ConsentResult<bool> {
    match non_blank(value).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(other) => Err(ConsentError::InvalidConfig(format!(
            "{name} must be true or false, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = CoreConfig::builder().build().unwrap();
        assert_eq!(cfg.max_range_window(), MAX_RANGE_WINDOW);
        assert!(cfg.cache().enabled);
        assert_eq!(cfg.retry().max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_builder_rejects_out_of_range_values() {
        assert!(CoreConfig::builder().max_range_window(0).build().is_err());
        assert!(CoreConfig::builder()
            .max_range_window(MAX_RANGE_WINDOW + 1)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .ledger_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .retry(RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(1),
            })
            .build()
            .is_err());
        assert!(CoreConfig::builder()
            .cache(CacheConfig {
                status_ttl: Duration::from_millis(10),
                ..CacheConfig::default()
            })
            .build()
            .is_err());
    }

    #[test]
    fn test_disabled_cache_skips_ttl_validation() {
        let cache = CacheConfig {
            status_ttl: Duration::ZERO,
            ..CacheConfig::disabled()
        };
        assert!(CoreConfig::builder().cache(cache).build().is_ok());
    }

    #[test]
    fn test_env_value_helpers() {
        assert_eq!(u64_from_env_value("X", None, 7).unwrap(), 7);
        assert_eq!(u64_from_env_value("X", Some("  ".into()), 7).unwrap(), 7);
        assert_eq!(u64_from_env_value("X", Some("42".into()), 7).unwrap(), 42);
        assert!(u64_from_env_value("X", Some("forty".into()), 7).is_err());

        assert_eq!(
            millis_from_env_value("X", Some("250".into()), Duration::from_secs(1)).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            secs_from_env_value("X", None, Duration::from_secs(30)).unwrap(),
            Duration::from_secs(30)
        );
        assert!(bool_from_env_value("X", Some("true".into()), false).unwrap());
        assert!(bool_from_env_value("X", Some("maybe".into()), false).is_err());
    }
}
