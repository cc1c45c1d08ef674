//! # pagerops-sync
//!
//! Keeps the cache in step with the provider.
//!
//! - [`SchedulerHandle`] - Polling loop with backoff, auth pause and manual refresh
//! - [`fetch`] - One polling cycle against an [`IncidentProvider`](pagerops_remote::IncidentProvider)
//! - [`ProviderSlot`] - The provider for the current api key
//! - [`SettingsManager`] - Live, persisted settings
//! - [`PagerOps`] - The command facade

pub mod app;
pub mod fetch;
pub mod scheduler;
pub mod settings;
pub mod slot;

pub use app::{PagerOps, Stores};
pub use scheduler::{RefreshOutcome, SchedulerConfig, SchedulerHandle, SchedulerState, SyncStatus};
pub use settings::SettingsManager;
pub use slot::{PagerDutyFactory, ProviderFactory, ProviderSlot};
