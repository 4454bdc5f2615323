use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{AppState, router};
use consent_core::config::{
    bool_from_env_value, millis_from_env_value, secs_from_env_value, u64_from_env_value,
};
use consent_core::constants::{
    DEFAULT_FOLLOW_INTERVAL, DEFAULT_LEDGER_PATH, DEFAULT_LEDGER_TIMEOUT, MAX_RANGE_WINDOW,
};
use consent_core::{
    CacheConfig, ConsentCore, ConsentResult, CoreConfig, FileLedger, RetryConfig, SystemClock,
};

/// Main entry point for the consent ledger query server
///
/// Replays the ledger file into the projection, follows appends made by other writers, and
/// serves the read-only REST API.
///
/// # Environment Variables
/// - `CONSENT_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `CONSENT_LEDGER_PATH`: JSON-lines ledger file (default: "consent_ledger.jsonl")
/// - `CONSENT_LEDGER_TIMEOUT_MS`, `CONSENT_LEDGER_MAX_RETRIES`, `CONSENT_LEDGER_BACKOFF_MS`
/// - `CONSENT_MAX_RANGE_WINDOW`, `CONSENT_FOLLOW_INTERVAL_MS`
/// - `CONSENT_STATUS_TTL_SECS`, `CONSENT_LISTING_TTL_SECS`, `CONSENT_CACHE_MAX_ENTRIES`,
///   `CONSENT_CACHE_DISABLED`
///
/// # Returns
/// * `Ok(())` - If the server shuts down cleanly
/// * `Err(anyhow::Error)` - If configuration, replay, or the listener fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("consent=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(config_from_env()?);
    let rest_addr = std::env::var("CONSENT_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let ledger_path =
        std::env::var("CONSENT_LEDGER_PATH").unwrap_or_else(|_| DEFAULT_LEDGER_PATH.into());

    let core = ConsentCore::new(
        cfg,
        Arc::new(FileLedger::new(&ledger_path)),
        Arc::new(SystemClock),
    );
    let applied = core.start().await?;
    tracing::info!("++ Replayed {} event(s) from {}", applied, ledger_path);
    let follower = core.spawn_follower();

    tracing::info!("++ Starting consent REST on {}", rest_addr);
    let app = router(AppState::new(core));
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    follower.abort();
    tracing::info!("++ Consent REST stopped");
    Ok(())
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Resolves [`CoreConfig`] from `CONSENT_*` variables, falling back to defaults.
fn config_from_env() -> ConsentResult<CoreConfig> {
    let retry_defaults = RetryConfig::default();
    let cache_defaults = CacheConfig::default();

    let retry = RetryConfig {
        max_retries: u64_from_env_value(
            "CONSENT_LEDGER_MAX_RETRIES",
            env("CONSENT_LEDGER_MAX_RETRIES"),
            u64::from(retry_defaults.max_retries),
        )?
        .try_into()
        .unwrap_or(u32::MAX),
        initial_backoff: millis_from_env_value(
            "CONSENT_LEDGER_BACKOFF_MS",
            env("CONSENT_LEDGER_BACKOFF_MS"),
            retry_defaults.initial_backoff,
        )?,
        ..retry_defaults
    };

    let disabled = bool_from_env_value(
        "CONSENT_CACHE_DISABLED",
        env("CONSENT_CACHE_DISABLED"),
        false,
    )?;
    let cache = CacheConfig {
        enabled: !disabled,
        max_entries: u64_from_env_value(
            "CONSENT_CACHE_MAX_ENTRIES",
            env("CONSENT_CACHE_MAX_ENTRIES"),
            cache_defaults.max_entries,
        )?,
        status_ttl: secs_from_env_value(
            "CONSENT_STATUS_TTL_SECS",
            env("CONSENT_STATUS_TTL_SECS"),
            cache_defaults.status_ttl,
        )?,
        listing_ttl: secs_from_env_value(
            "CONSENT_LISTING_TTL_SECS",
            env("CONSENT_LISTING_TTL_SECS"),
            cache_defaults.listing_ttl,
        )?,
        ..cache_defaults
    };

    CoreConfig::builder()
        .ledger_timeout(millis_from_env_value(
            "CONSENT_LEDGER_TIMEOUT_MS",
            env("CONSENT_LEDGER_TIMEOUT_MS"),
            DEFAULT_LEDGER_TIMEOUT,
        )?)
        .retry(retry)
        .max_range_window(u64_from_env_value(
            "CONSENT_MAX_RANGE_WINDOW",
            env("CONSENT_MAX_RANGE_WINDOW"),
            MAX_RANGE_WINDOW,
        )?)
        .cache(cache)
        .follow_interval(millis_from_env_value(
            "CONSENT_FOLLOW_INTERVAL_MS",
            env("CONSENT_FOLLOW_INTERVAL_MS"),
            DEFAULT_FOLLOW_INTERVAL,
        )?)
        .build()
}
