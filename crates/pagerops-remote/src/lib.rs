//! # pagerops-remote
//!
//! The incident-management backend seen by the sync engine.
//!
//! - [`IncidentProvider`] - The async provider trait
//! - [`PagerDutyClient`] - PagerDuty REST API v2 over reqwest
//! - [`MockProvider`] - Scripted provider for tests

pub mod mock;
pub mod pagerduty;
pub mod provider;
pub mod wire;

pub use mock::{MockFailure, MockProvider};
pub use pagerduty::PagerDutyClient;
pub use provider::{IncidentProvider, ListFilter, Page};
