//! # pagerops-cache
//!
//! The local cache at the heart of PagerOps.
//!
//! This crate provides:
//! - [`EntityStore`] - In-memory tables for services, incidents, users, templates and drafts
//! - [`ownership`] - The per-field ownership table driving every merge
//! - [`reconcile`] - Merging a fetched [`RemoteBatch`] into the store
//! - [`aggregate`] - Derived status counts
//! - [`SyncCache`] - Mutex-guarded store with snapshot subscriptions
//! - [`DraftManager`] - Draft lifecycle with debounced persistence
//! - [`ViewState`] - Selection, search, filter and tab
//! - [`persist`] - Persistence traits and an in-memory implementation
//!
//! ## Example
//!
//! ```
//! use pagerops_cache::{RemoteBatch, SyncCache};
//! use pagerops_core::{Incident, Service};
//!
//! let cache = SyncCache::default();
//! cache.subscribe(|snapshot| println!("revision {}: {:?}", snapshot.revision, snapshot.counts));
//!
//! cache.apply_remote_batch(RemoteBatch {
//!     services: vec![Service::new("PSVC1", "API")],
//!     open_incidents: vec![Incident::new("PINC1", "5xx spike", "API")],
//!     complete: true,
//!     ..RemoteBatch::default()
//! });
//! assert_eq!(cache.snapshot().counts.triggered, 1);
//! ```

pub mod aggregate;
pub mod cache;
pub mod drafts;
pub mod ownership;
pub mod persist;
pub mod reconcile;
pub mod store;
pub mod view;

// Re-export main types
pub use aggregate::compute_status_counts;
pub use cache::{CacheOptions, CacheSnapshot, SubscriptionId, SyncCache};
pub use drafts::DraftManager;
pub use persist::{DraftStore, LocalOverrides, MemoryStore, OverrideStore, SettingsStore, TemplateStore};
pub use reconcile::{ReconcileOptions, ReconcileReport, RemoteBatch};
pub use store::{Entity, EntityStore, PendingStatus, WriteOutcome};
pub use view::{IncidentFilter, Tab, ViewState};
