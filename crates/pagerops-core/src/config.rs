//! Engine configuration loaded from `~/.pagerops/config.yaml`.
//!
//! Every key is optional; a missing file yields the defaults. Unlike
//! [`Settings`](crate::settings::Settings), this file is operator-owned
//! tuning for the sync engine and is read once at startup.
//!
//! ```yaml
//! sync:
//!   fetch_timeout_secs: 15
//!   jitter_ratio: 0.1
//!   backoff_initial_ms: 1000
//!   backoff_max_secs: 300
//! drafts:
//!   debounce_ms: 500
//! remote:
//!   api_base_url: https://api.pagerduty.com
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{PagerOpsError, Result};
use crate::recovery::BackoffPolicy;

/// Default config file path (`~/.pagerops/config.yaml`).
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".pagerops").join("config.yaml"))
}

/// Default database path (`~/.pagerops/pagerops.db`).
pub fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pagerops")
        .join("pagerops.db")
}

/// Root of the engine configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub drafts: DraftConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl EngineConfig {
    /// Load from the default path, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a specific path, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file does not exist, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| PagerOpsError::io("reading config", path, e))?;
        let config = Self::parse(&content).map_err(|message| PagerOpsError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str::<EngineConfig>(content).map_err(|e| e.to_string())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> Result<()> { Err(PagerOpsError::ConfigValidation { message }) };

        if self.sync.fetch_timeout_secs == 0 {
            return invalid("sync.fetch_timeout_secs must be > 0".into());
        }
        if !(0.0..=0.5).contains(&self.sync.jitter_ratio) {
            return invalid(format!(
                "sync.jitter_ratio must be between 0 and 0.5, got {}",
                self.sync.jitter_ratio
            ));
        }
        if self.sync.backoff_max_secs * 1000 < self.sync.backoff_initial_ms {
            return invalid(format!(
                "sync.backoff_max_secs ({}s) is below sync.backoff_initial_ms ({}ms)",
                self.sync.backoff_max_secs, self.sync.backoff_initial_ms
            ));
        }
        if self.remote.page_limit == 0 || self.remote.max_pages == 0 {
            return invalid("remote.page_limit and remote.max_pages must be > 0".into());
        }
        Ok(())
    }
}

/// Refresh scheduler and reconciliation tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub fetch_timeout_secs: u64,
    /// Poll interval randomization, as a fraction of the interval.
    pub jitter_ratio: f64,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
    /// How far back resolved incidents are fetched.
    pub resolved_window_hours: u64,
    /// How long resolved incidents are kept in the cache.
    pub resolved_retention_hours: u64,
    /// Move vanished open incidents to resolved when a fetch is complete.
    pub infer_resolution: bool,
    /// How long an optimistic status change shields against stale data.
    pub pending_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 15,
            jitter_ratio: 0.1,
            backoff_initial_ms: 1000,
            backoff_max_secs: 300,
            resolved_window_hours: 24,
            resolved_retention_hours: 48,
            infer_resolution: false,
            pending_ttl_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            multiplier: 2.0,
        }
    }

    pub fn resolved_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.resolved_window_hours as i64)
    }

    pub fn resolved_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.resolved_retention_hours as i64)
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_ttl_secs as i64)
    }
}

/// Draft persistence tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DraftConfig {
    /// Quiet period before a draft edit is written to disk.
    pub debounce_ms: u64,
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

impl DraftConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Remote provider endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_base_url: String,
    /// Records requested per page.
    pub page_limit: u32,
    /// Pages followed before a listing is reported incomplete.
    pub max_pages: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.pagerduty.com".to_string(),
            page_limit: 100,
            max_pages: 10,
        }
    }
}

/// Local database location.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to `~/.pagerops/pagerops.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(default_database_path)
    }
}
