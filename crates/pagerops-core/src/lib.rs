//! # pagerops-core
//!
//! Core types, errors, and utilities for the PagerOps incident sync engine.
//!
//! This crate provides:
//! - [`PagerOpsError`] - Error type shared by every PagerOps crate
//! - [`logging`] - Tracing setup and log file locations
//! - [`types`] - Entity records held by the cache
//! - [`settings`] - User settings and their key-value form
//! - [`config`] - Engine configuration from `~/.pagerops/config.yaml`
//! - [`recovery`] - Backoff and jitter
//! - [`timestamp`] - The timestamp parsing routine
//!
//! ## Example
//!
//! ```no_run
//! use pagerops_core::{EngineConfig, logging};
//!
//! fn main() -> pagerops_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = EngineConfig::load()?;
//!     tracing::info!(base_url = %config.remote.api_base_url, "loaded config");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod recovery;
pub mod settings;
pub mod timestamp;
pub mod types;

// Re-export main types for convenience
pub use config::{DatabaseConfig, DraftConfig, EngineConfig, RemoteConfig, SyncConfig};
pub use error::{PagerOpsError, Result};
pub use logging::{LogGuard, init_logging};
pub use recovery::BackoffPolicy;
pub use settings::{Settings, Theme};
pub use types::{
    Alert, DraftFields, DraftNote, EntityKind, EntityRef, Incident, IncidentId, IncidentStatus, Note,
    Service, ServiceId, StatusCounts, Template, TemplateId, Urgency, User,
};
