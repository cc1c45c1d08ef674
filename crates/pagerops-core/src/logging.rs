//! Logging infrastructure for PagerOps.
//!
//! Structured logging using the `tracing` ecosystem:
//!
//! - JSON lines written to `~/.pagerops/logs/pagerops.log` (daily rotation)
//! - Compact human-readable output on stderr
//! - `RUST_LOG` overrides the default `pagerops=info` filter
//!
//! ## Example
//!
//! ```no_run
//! use pagerops_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//! tracing::info!("engine started");
//! tracing::debug!(incident_id = "P1ABC", "merged incident");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{PagerOpsError, Result};

/// Guard that must be held to ensure log flushing on shutdown.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the PagerOps logging system.
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.pagerops/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
///
/// Keep the returned [`LogGuard`] alive for the lifetime of the process.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| PagerOpsError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pagerops.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pagerops={default_level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Returns `~/.pagerops/logs/`.
pub fn default_log_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| PagerOpsError::Internal {
        message: "HOME environment variable not set".into(),
    })?;

    Ok(PathBuf::from(home).join(".pagerops").join("logs"))
}

/// Log a refresh scheduler transition.
///
/// ```ignore
/// log_sync_event!("backoff", failures = 3, delay_ms = 4000);
/// ```
#[macro_export]
macro_rules! log_sync_event {
    ($event:expr) => {
        tracing::info!(
            target: "pagerops::sync",
            event = $event,
            "sync event"
        )
    };
    ($event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "pagerops::sync",
            event = $event,
            $($field)*,
            "sync event"
        )
    };
}
