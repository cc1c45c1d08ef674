//! The remote incident provider seam.
//!
//! [`IncidentProvider`] abstracts the incident-management backend so the
//! sync engine can run against PagerDuty or a scripted mock.
//!
//! ## Implementations
//!
//! - [`PagerDutyClient`](crate::pagerduty::PagerDutyClient) - PagerDuty REST API v2 via reqwest
//! - [`MockProvider`](crate::mock::MockProvider) - Scripted in-memory provider for tests

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagerops_core::{Alert, Incident, Note, Result, Service, User};

/// One listing, possibly cut short.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// False when the provider had more records than were read.
    pub complete: bool,
}

impl<T> Page<T> {
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            complete: true,
        }
    }

    pub fn partial(items: Vec<T>) -> Self {
        Self {
            items,
            complete: false,
        }
    }
}

/// Server-side narrowing of incident listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only incidents assigned to one of these users.
    pub user_ids: Vec<String>,
}

impl ListFilter {
    pub fn assigned_to(user_id: impl Into<String>) -> Self {
        Self {
            user_ids: vec![user_id.into()],
        }
    }
}

/// Operations consumed from the incident-management backend.
///
/// Every call may fail with a network, timeout, auth, rate-limit or
/// protocol error.
#[async_trait]
pub trait IncidentProvider: Send + Sync {
    /// The user owning the api key.
    async fn current_user(&self) -> Result<User>;

    async fn list_services(&self) -> Result<Page<Service>>;

    async fn list_users(&self) -> Result<Page<User>>;

    /// Triggered and acknowledged incidents.
    async fn list_open_incidents(&self, filter: &ListFilter) -> Result<Page<Incident>>;

    /// Incidents resolved since `since`.
    async fn list_resolved_incidents(
        &self,
        since: DateTime<Utc>,
        filter: &ListFilter,
    ) -> Result<Page<Incident>>;

    /// `from` is the email address of the acting user.
    async fn acknowledge(&self, incident_id: &str, from: &str) -> Result<()>;

    async fn resolve(&self, incident_id: &str, from: &str) -> Result<()>;

    async fn add_note(&self, incident_id: &str, from: &str, content: &str) -> Result<Note>;

    /// Alerts grouped under one incident.
    async fn list_incident_alerts(&self, incident_id: &str) -> Result<Vec<Alert>>;

    /// Snooze an incident. The provider acknowledges it for `duration`,
    /// after which it triggers again.
    async fn snooze(&self, incident_id: &str, from: &str, duration: Duration) -> Result<()>;

    /// Move an incident to `level` of its escalation policy.
    async fn escalate(&self, incident_id: &str, from: &str, level: u32) -> Result<()>;

    /// Merge `source_ids` into `target_id`. The sources end up resolved.
    async fn merge_incidents(
        &self,
        target_id: &str,
        source_ids: &[String],
        from: &str,
    ) -> Result<()>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}
