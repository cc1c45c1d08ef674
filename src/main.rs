//! PagerOps - headless incident console
//!
//! Keeps a local cache of PagerDuty incidents in sync and exposes the
//! triage commands on the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Store the API key once
//! pagerops set-api-key u+abcdEFGH1234
//!
//! # Poll until Ctrl-C, printing newly triggered incidents
//! pagerops run
//!
//! # One refresh, then print counts and sync status as JSON
//! pagerops status
//!
//! # Acknowledge or resolve an incident
//! pagerops ack PXYZ123
//! pagerops resolve PXYZ123
//!
//! # Snooze for an hour, escalate, merge, list alerts
//! pagerops snooze PXYZ123 --minutes 60
//! pagerops escalate PXYZ123 2
//! pagerops merge PXYZ123 PABC456 PDEF789
//! pagerops alerts PXYZ123
//!
//! # With verbose logging in a custom directory
//! pagerops -v --log-dir /tmp/pagerops-logs run
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use pagerops_core::{EngineConfig, LogGuard, init_logging};
use pagerops_db::CacheDatabase;
use pagerops_sync::{PagerDutyFactory, PagerOps, RefreshOutcome, SettingsManager, Stores};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

/// PagerOps incident console
///
/// Syncs open and recently resolved incidents into a local SQLite cache
/// and applies triage actions and notes against PagerDuty.
#[derive(Parser, Debug)]
#[command(name = "pagerops")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.pagerops/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Engine configuration file (defaults to ~/.pagerops/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Local database (overrides database.path from the config)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll continuously until interrupted
    Run,
    /// Refresh once and print the sync status as JSON
    Status,
    /// Acknowledge an incident
    Ack { incident_id: String },
    /// Resolve an incident
    Resolve { incident_id: String },
    /// Snooze an open incident
    Snooze {
        incident_id: String,
        /// Snooze length in minutes
        #[arg(long, default_value_t = 60)]
        minutes: u64,
    },
    /// Escalate an open incident to a level of its escalation policy
    Escalate { incident_id: String, level: u32 },
    /// Merge source incidents into a target incident
    Merge {
        target_id: String,
        #[arg(required = true)]
        source_ids: Vec<String>,
    },
    /// Print the alerts grouped under an incident as JSON
    Alerts { incident_id: String },
    /// Store the PagerDuty API key
    SetApiKey { api_key: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match setup_logging(&cli) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::from(1);
        }
    };

    info!(command = ?cli.command, "starting pagerops");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => {
            info!("pagerops exited normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("pagerops error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Set up logging based on CLI arguments.
fn setup_logging(cli: &Cli) -> pagerops_core::Result<LogGuard> {
    init_logging(cli.log_dir.clone(), cli.verbose > 0)
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(db) = &cli.db {
        config.database.path = Some(db.clone());
    }
    Ok(config)
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let db_path = config.database.resolved_path();
    let db = Arc::new(
        CacheDatabase::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );

    if let Command::SetApiKey { api_key } = &cli.command {
        let settings = SettingsManager::load(db);
        let stored = settings.set_api_key(api_key.clone())?;
        println!("API key saved ({})", stored.api_key.unwrap_or_default());
        return Ok(());
    }

    let factory = Arc::new(PagerDutyFactory::new(
        config.remote.clone(),
        config.sync.fetch_timeout(),
    ));
    let engine = PagerOps::start(&config, Stores::shared(db), factory)?;

    let result = match &cli.command {
        Command::Run => run_until_interrupted(&engine).await,
        Command::Status => print_status(&engine).await,
        Command::Ack { incident_id } => {
            first_sync(&engine).await?;
            engine.acknowledge(incident_id).await.map_err(Into::into)
        }
        Command::Resolve { incident_id } => {
            first_sync(&engine).await?;
            engine.resolve(incident_id).await.map_err(Into::into)
        }
        Command::Snooze { incident_id, minutes } => {
            first_sync(&engine).await?;
            let duration = Duration::from_secs(minutes.saturating_mul(60));
            engine.snooze(incident_id, duration).await.map_err(Into::into)
        }
        Command::Escalate { incident_id, level } => {
            first_sync(&engine).await?;
            engine.escalate(incident_id, *level).await.map_err(Into::into)
        }
        Command::Merge { target_id, source_ids } => {
            first_sync(&engine).await?;
            engine
                .merge_incidents(target_id, source_ids)
                .await
                .map_err(Into::into)
        }
        Command::Alerts { incident_id } => print_alerts(&engine, incident_id).await,
        Command::SetApiKey { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}

/// Wait for the scheduler's first fetch to land.
async fn first_sync(engine: &PagerOps) -> anyhow::Result<()> {
    match engine.refresh_now().await {
        RefreshOutcome::Synced(_) => Ok(()),
        RefreshOutcome::AuthRequired => bail!("no valid API key; run `pagerops set-api-key`"),
        RefreshOutcome::Failed { message } => bail!("sync failed: {}", message),
        RefreshOutcome::Deferred { retry_at } => {
            bail!("sync is backing off until {}", retry_at.to_rfc3339())
        }
        RefreshOutcome::Stopped => bail!("engine stopped"),
    }
}

async fn print_status(engine: &PagerOps) -> anyhow::Result<()> {
    let outcome = first_sync(engine).await;
    let snapshot = engine.snapshot();
    let report = serde_json::json!({
        "status": engine.sync_status(),
        "counts": snapshot.counts,
        "open": snapshot.open.len(),
        "resolved": snapshot.resolved.len(),
        "services": snapshot.services.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    outcome
}

async fn print_alerts(engine: &PagerOps, incident_id: &str) -> anyhow::Result<()> {
    let alerts = engine
        .incident_alerts(incident_id)
        .await
        .with_context(|| format!("listing alerts for {}", incident_id))?;
    println!("{}", serde_json::to_string_pretty(&alerts)?);
    Ok(())
}

async fn run_until_interrupted(engine: &PagerOps) -> anyhow::Result<()> {
    let mut triggered = engine.subscribe_triggered();
    let mut status = engine.subscribe_status();
    println!("Polling PagerDuty; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            incidents = triggered.recv() => match incidents {
                Ok(incidents) => {
                    for incident in incidents {
                        println!(
                            "TRIGGERED {} [{}] {} ({})",
                            incident.id, incident.urgency.as_str(), incident.title, incident.service
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    println!("missed {} trigger notifications", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                let counts = engine.snapshot().counts;
                match &current.message {
                    Some(message) => println!("{:?}: {}", current.state, message),
                    None => println!(
                        "{:?}: {} triggered, {} acknowledged, {} resolved",
                        current.state, counts.triggered, counts.acknowledged, counts.resolved
                    ),
                }
            }
        }
    }
}
