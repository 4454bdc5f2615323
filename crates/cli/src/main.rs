use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_shared::params;
use api_shared::{
    ConsentListRes, ConsentRes, EventListRes, LedgerInfoRes, RequestListRes, RequestRes, StatusRes,
};
use consent_core::constants::DEFAULT_LEDGER_PATH;
use consent_core::{
    CacheConfig, Clock, ConsentCore, ConsentError, ConsentResult, ConsentView, CoreConfig,
    FileLedger, RequestView, SystemClock,
};
use consent_types::{DataCategory, Purpose};

#[derive(Parser)]
#[command(name = "consent")]
#[command(about = "Consent ledger CLI")]
struct Cli {
    /// Path of the JSON-lines ledger file
    #[arg(long, env = "CONSENT_LEDGER_PATH", default_value = DEFAULT_LEDGER_PATH)]
    ledger: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grant consent from a patient to a provider
    Grant {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        provider: String,
        /// Data categories (comma-separated)
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
        /// Purposes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        purposes: Vec<String>,
        /// Expiration as epoch seconds; 0 never expires
        #[arg(long, default_value_t = 0)]
        expires: u64,
    },
    /// Revoke a consent
    Revoke {
        consent_id: String,
        /// Principal performing the revoke; must be the patient
        #[arg(long)]
        caller: String,
    },
    /// Ask a patient for access
    Request {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        patient: String,
        /// Data categories (comma-separated)
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
        /// Purposes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        purposes: Vec<String>,
        /// Expiration as epoch seconds; 0 never expires
        #[arg(long, default_value_t = 0)]
        expires: u64,
    },
    /// Approve a pending access request
    Approve {
        request_id: String,
        #[arg(long)]
        caller: String,
    },
    /// Deny a pending access request
    Deny {
        request_id: String,
        #[arg(long)]
        caller: String,
    },
    /// Check consent for a (patient, provider, category) tuple
    Status {
        #[arg(long)]
        patient: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        category: String,
    },
    /// List consents granted by a patient or held by a provider
    Consents {
        #[arg(long, conflicts_with = "provider", required_unless_present = "provider")]
        patient: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        include_expired: bool,
    },
    /// List access requests addressed to a patient or made by a provider
    Requests {
        #[arg(long, conflicts_with = "provider", required_unless_present = "provider")]
        patient: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        /// pending, approved, denied or all
        #[arg(long)]
        status: Option<String>,
    },
    /// Print raw ledger events
    History {
        #[arg(long)]
        principal: Option<String>,
        #[arg(long, default_value_t = 1)]
        from: u64,
        /// Defaults to the last applied sequence
        #[arg(long)]
        to: Option<u64>,
    },
    /// Show ledger connectivity
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("consent=warn".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("error [{}]: {}", e.code(), e.public_message());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Opens the ledger, replays it, and runs one command.
///
/// # Returns
/// The command's JSON output.
async fn run(cli: Cli) -> ConsentResult<Value> {
    let cfg = CoreConfig::builder().cache(CacheConfig::disabled()).build()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    tracing::debug!(ledger = %cli.ledger.display(), "opening ledger");
    let core = ConsentCore::new(
        Arc::new(cfg),
        Arc::new(FileLedger::new(cli.ledger)),
        clock.clone(),
    );
    core.start().await?;
    execute(&core, clock.as_ref(), cli.command).await
}

async fn execute(core: &ConsentCore, clock: &dyn Clock, command: Commands) -> ConsentResult<Value> {
    let auth = core.authorization();
    let queries = core.queries();

    match command {
        Commands::Grant {
            patient,
            provider,
            categories,
            purposes,
            expires,
        } => {
            let patient = params::principal("patient", Some(patient.as_str()))?;
            let provider = params::principal("provider", Some(provider.as_str()))?;
            let records = auth
                .grant_consent(
                    &patient,
                    &patient,
                    &provider,
                    &categories_from(&categories)?,
                    &purposes_from(&purposes)?,
                    expires,
                )
                .await?;
            let now = clock.now();
            let views: Vec<ConsentView> = records
                .into_iter()
                .map(|r| ConsentView::at(r, now))
                .collect();
            to_json(&ConsentListRes::from(views))
        }
        Commands::Revoke { consent_id, caller } => {
            let id = params::record_id(&consent_id)?;
            let caller = params::principal("caller", Some(caller.as_str()))?;
            let record = auth.revoke_consent(&id, &caller).await?;
            to_json(&ConsentRes::from(ConsentView::at(record, clock.now())))
        }
        Commands::Request {
            provider,
            patient,
            categories,
            purposes,
            expires,
        } => {
            let provider = params::principal("provider", Some(provider.as_str()))?;
            let patient = params::principal("patient", Some(patient.as_str()))?;
            let requests = auth
                .request_access(
                    &provider,
                    &patient,
                    &categories_from(&categories)?,
                    &purposes_from(&purposes)?,
                    expires,
                )
                .await?;
            let now = clock.now();
            let views: Vec<RequestView> = requests
                .into_iter()
                .map(|r| RequestView::at(r, now))
                .collect();
            to_json(&RequestListRes::from(views))
        }
        Commands::Approve { request_id, caller } => {
            let id = params::record_id(&request_id)?;
            let caller = params::principal("caller", Some(caller.as_str()))?;
            let approval = auth.approve_request(&id, &caller).await?;
            let now = clock.now();
            Ok(json!({
                "request": RequestRes::from(RequestView::at(approval.request, now)),
                "consent": ConsentRes::from(ConsentView::at(approval.consent, now)),
            }))
        }
        Commands::Deny { request_id, caller } => {
            let id = params::record_id(&request_id)?;
            let caller = params::principal("caller", Some(caller.as_str()))?;
            let request = auth.deny_request(&id, &caller).await?;
            to_json(&RequestRes::from(RequestView::at(request, clock.now())))
        }
        Commands::Status {
            patient,
            provider,
            category,
        } => {
            let patient = params::principal("patient", Some(patient.as_str()))?;
            let provider = params::principal("provider", Some(provider.as_str()))?;
            let category = params::data_category("category", Some(category.as_str()))?;
            let status = queries.check_status(&patient, &provider, category).await?;
            to_json(&StatusRes::from(status))
        }
        Commands::Consents {
            patient,
            provider,
            include_expired,
        } => {
            let consents = match (patient, provider) {
                (Some(patient), _) => {
                    let patient = params::principal("patient", Some(patient.as_str()))?;
                    queries.consents_for_patient(&patient, include_expired).await?
                }
                (None, provider) => {
                    let provider = params::principal("provider", provider.as_deref())?;
                    queries.consents_for_provider(&provider, include_expired).await?
                }
            };
            to_json(&ConsentListRes::from(consents))
        }
        Commands::Requests {
            patient,
            provider,
            status,
        } => {
            let filter = params::request_filter(status.as_deref())?;
            let requests = match (patient, provider) {
                (Some(patient), _) => {
                    let patient = params::principal("patient", Some(patient.as_str()))?;
                    queries.requests_for_patient(&patient, filter).await?
                }
                (None, provider) => {
                    let provider = params::principal("provider", provider.as_deref())?;
                    queries.requests_for_provider(&provider, filter).await?
                }
            };
            to_json(&RequestListRes::from(requests))
        }
        Commands::History {
            principal,
            from,
            to,
        } => {
            let principal = params::optional_principal(principal.as_deref())?;
            let to = match to {
                Some(to) => to,
                None => {
                    let last = from.saturating_add(core.config().max_range_window() - 1);
                    core.materializer().projection().watermark().clamp(from, last)
                }
            };
            let events = queries.events(principal.as_ref(), from, to).await?;
            to_json(&EventListRes::try_from(events)?)
        }
        Commands::Info => to_json(&LedgerInfoRes::from(queries.ledger_info().await)),
    }
}

fn categories_from(raw: &[String]) -> ConsentResult<Vec<DataCategory>> {
    raw.iter()
        .map(|c| params::data_category("categories", Some(c.as_str())))
        .collect()
}

fn purposes_from(raw: &[String]) -> ConsentResult<Vec<Purpose>> {
    raw.iter()
        .map(|p| params::purpose("purposes", Some(p.as_str())))
        .collect()
}

fn to_json<T: serde::Serialize>(value: &T) -> ConsentResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| ConsentError::Internal(format!("failed to render output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(ledger: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec!["consent", "--ledger", ledger.to_str().unwrap()];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[tokio::test]
    async fn test_grant_then_status_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let granted = run(cli(
            &path,
            &[
                "grant",
                "--patient",
                "P1",
                "--provider",
                "Q1",
                "--categories",
                "medical_records,vital_signs",
                "--purposes",
                "treatment",
            ],
        ))
        .await
        .unwrap();
        assert_eq!(granted["consents"].as_array().unwrap().len(), 2);

        let status = run(cli(
            &path,
            &[
                "status",
                "--patient",
                "P1",
                "--provider",
                "Q1",
                "--category",
                "vital_signs",
            ],
        ))
        .await
        .unwrap();
        assert_eq!(status["hasConsent"], true);

        let history = run(cli(&path, &["history"])).await.unwrap();
        assert_eq!(history["events"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_request_approve_and_guards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");

        let requested = run(cli(
            &path,
            &[
                "request",
                "--provider",
                "Q1",
                "--patient",
                "P1",
                "--categories",
                "genetic_data",
                "--purposes",
                "research",
            ],
        ))
        .await
        .unwrap();
        let id = requested["requests"][0]["id"].as_str().unwrap().to_owned();

        let err = run(cli(&path, &["approve", &id, "--caller", "Q1"]))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "FORBIDDEN");

        let approved = run(cli(&path, &["approve", &id, "--caller", "P1"]))
            .await
            .unwrap();
        assert_eq!(approved["request"]["status"], "approved");
        assert_eq!(approved["consent"]["requestId"], id.as_str());

        let err = run(cli(&path, &["deny", &id, "--caller", "P1"]))
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "ALREADY_PROCESSED");

        let pending = run(cli(&path, &["requests", "--provider", "Q1", "--status", "pending"]))
            .await
            .unwrap();
        assert!(pending["requests"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_category_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let err = run(cli(
            &path,
            &[
                "grant",
                "--patient",
                "P1",
                "--provider",
                "Q1",
                "--categories",
                "dental",
                "--purposes",
                "treatment",
            ],
        ))
        .await
        .unwrap_err();
        assert_eq!(err.code().as_str(), "INVALID_INPUT");
    }
}
