//! Scripted in-memory provider.
//!
//! Serves a fixed account and can be told to fail upcoming calls, stall, or
//! report truncated listings. Status changes and notes are applied to its
//! own data so later listings reflect them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagerops_core::{
    Alert, Incident, IncidentStatus, Note, PagerOpsError, Result, Service, User,
};

use crate::provider::{IncidentProvider, ListFilter, Page};

/// Failure kinds the mock can inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Network,
    Timeout,
    RateLimited(Option<u64>),
    Auth,
    Protocol,
}

impl MockFailure {
    fn into_error(self) -> PagerOpsError {
        match self {
            Self::Network => PagerOpsError::network("connection refused"),
            Self::Timeout => PagerOpsError::Timeout { timeout_secs: 15 },
            Self::RateLimited(retry_after_secs) => PagerOpsError::RateLimited { retry_after_secs },
            Self::Auth => PagerOpsError::auth("provider returned 401: invalid token"),
            Self::Protocol => PagerOpsError::RemoteProtocol {
                status: 500,
                message: "unexpected body".into(),
            },
        }
    }
}

#[derive(Default)]
struct MockState {
    user: Option<User>,
    services: Vec<Service>,
    users: Vec<User>,
    incidents: Vec<Incident>,
    alerts: HashMap<String, Vec<Alert>>,
    truncated: bool,
    /// Consumed one per call by read operations.
    fetch_failures: VecDeque<MockFailure>,
    action_failure: Option<MockFailure>,
    delay: Option<Duration>,
    calls: HashMap<&'static str, usize>,
    actions: Vec<(String, String)>,
    senders: Vec<String>,
}

/// Provider double for tests and offline runs.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: User) -> Self {
        self.lock().user = Some(user);
        self
    }

    pub fn with_services(self, services: Vec<Service>) -> Self {
        self.lock().services = services;
        self
    }

    pub fn with_users(self, users: Vec<User>) -> Self {
        self.lock().users = users;
        self
    }

    pub fn with_incidents(self, incidents: Vec<Incident>) -> Self {
        self.lock().incidents = incidents;
        self
    }

    pub fn with_alerts(self, incident_id: &str, alerts: Vec<Alert>) -> Self {
        self.lock().alerts.insert(incident_id.to_string(), alerts);
        self
    }

    /// Stall every read call for `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    /// Replace the incident list served from now on.
    pub fn set_incidents(&self, incidents: Vec<Incident>) {
        self.lock().incidents = incidents;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Report every listing as cut short.
    pub fn set_truncated(&self, truncated: bool) {
        self.lock().truncated = truncated;
    }

    /// Fail the next `count` read calls with `failure`.
    pub fn fail_next(&self, count: usize, failure: MockFailure) {
        let mut state = self.lock();
        for _ in 0..count {
            state.fetch_failures.push_back(failure.clone());
        }
    }

    /// Fail every write call until cleared.
    pub fn fail_actions(&self, failure: Option<MockFailure>) {
        self.lock().action_failure = failure;
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// `(operation, incident id)` for every successful write.
    pub fn actions(&self) -> Vec<(String, String)> {
        self.lock().actions.clone()
    }

    /// The `From` email of every successful write, in order.
    pub fn senders(&self) -> Vec<String> {
        self.lock().senders.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter_read(&self, method: &'static str) -> Result<()> {
        let delay = {
            let mut state = self.lock();
            *state.calls.entry(method).or_insert(0) += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.lock().fetch_failures.pop_front() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn enter_action(&self, method: &'static str) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(method).or_insert(0) += 1;
        match state.action_failure.clone() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }

    fn page<T>(&self, items: Vec<T>) -> Page<T> {
        Page {
            items,
            complete: !self.lock().truncated,
        }
    }

    fn incidents_where(&self, filter: &ListFilter, keep: impl Fn(&Incident) -> bool) -> Vec<Incident> {
        self.lock()
            .incidents
            .iter()
            .filter(|i| keep(i))
            .filter(|i| {
                filter.user_ids.is_empty()
                    || i.assigned_user_ids.iter().any(|u| filter.user_ids.contains(u))
            })
            .cloned()
            .collect()
    }

    /// Run one write against a known incident and record it.
    fn write(
        &self,
        method: &'static str,
        incident_id: &str,
        from: &str,
        apply: impl FnOnce(&mut Incident) -> Result<()>,
    ) -> Result<()> {
        self.enter_action(method)?;
        let mut state = self.lock();
        let incident = state
            .incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or_else(not_found)?;
        apply(incident)?;
        incident.updated_at = Utc::now();
        state.actions.push((method.to_string(), incident_id.to_string()));
        state.senders.push(from.to_string());
        Ok(())
    }

    fn set_status(
        &self,
        method: &'static str,
        incident_id: &str,
        from: &str,
        status: IncidentStatus,
    ) -> Result<()> {
        self.write(method, incident_id, from, |incident| {
            incident.status = status;
            Ok(())
        })
    }
}

fn not_found() -> PagerOpsError {
    PagerOpsError::from_http_status(404, None, "Incident Not Found")
}

fn reject_resolved(incident: &Incident) -> Result<()> {
    if incident.is_open() {
        Ok(())
    } else {
        Err(PagerOpsError::from_http_status(400, None, "Incident Already Resolved"))
    }
}

#[async_trait]
impl IncidentProvider for MockProvider {
    async fn current_user(&self) -> Result<User> {
        self.enter_read("current_user").await?;
        self.lock()
            .user
            .clone()
            .ok_or_else(|| PagerOpsError::auth("no user behind this api key"))
    }

    async fn list_services(&self) -> Result<Page<Service>> {
        self.enter_read("list_services").await?;
        let services = self.lock().services.clone();
        Ok(self.page(services))
    }

    async fn list_users(&self) -> Result<Page<User>> {
        self.enter_read("list_users").await?;
        let users = self.lock().users.clone();
        Ok(self.page(users))
    }

    async fn list_open_incidents(&self, filter: &ListFilter) -> Result<Page<Incident>> {
        self.enter_read("list_open_incidents").await?;
        let open = self.incidents_where(filter, |i| i.is_open());
        Ok(self.page(open))
    }

    async fn list_resolved_incidents(
        &self,
        since: DateTime<Utc>,
        filter: &ListFilter,
    ) -> Result<Page<Incident>> {
        self.enter_read("list_resolved_incidents").await?;
        let resolved = self.incidents_where(filter, |i| !i.is_open() && i.updated_at >= since);
        Ok(self.page(resolved))
    }

    async fn acknowledge(&self, incident_id: &str, from: &str) -> Result<()> {
        self.set_status("acknowledge", incident_id, from, IncidentStatus::Acknowledged)
    }

    async fn resolve(&self, incident_id: &str, from: &str) -> Result<()> {
        self.set_status("resolve", incident_id, from, IncidentStatus::Resolved)
    }

    async fn add_note(&self, incident_id: &str, from: &str, content: &str) -> Result<Note> {
        self.enter_action("add_note")?;
        let mut state = self.lock();
        let author = state.user.as_ref().map(|u| u.name.clone()).unwrap_or_default();
        let incident = state
            .incidents
            .iter_mut()
            .find(|i| i.id == incident_id)
            .ok_or_else(not_found)?;
        let note = Note {
            author,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        incident.notes.push(note.clone());
        state.actions.push(("add_note".to_string(), incident_id.to_string()));
        state.senders.push(from.to_string());
        Ok(note)
    }

    async fn list_incident_alerts(&self, incident_id: &str) -> Result<Vec<Alert>> {
        self.enter_read("list_incident_alerts").await?;
        let state = self.lock();
        if !state.incidents.iter().any(|i| i.id == incident_id) {
            return Err(not_found());
        }
        Ok(state.alerts.get(incident_id).cloned().unwrap_or_default())
    }

    async fn snooze(&self, incident_id: &str, from: &str, _duration: Duration) -> Result<()> {
        self.write("snooze", incident_id, from, |incident| {
            reject_resolved(incident)?;
            incident.status = IncidentStatus::Acknowledged;
            Ok(())
        })
    }

    async fn escalate(&self, incident_id: &str, from: &str, _level: u32) -> Result<()> {
        self.write("escalate", incident_id, from, |incident| {
            reject_resolved(incident)?;
            incident.status = IncidentStatus::Triggered;
            Ok(())
        })
    }

    async fn merge_incidents(
        &self,
        target_id: &str,
        source_ids: &[String],
        from: &str,
    ) -> Result<()> {
        self.enter_action("merge_incidents")?;
        let mut state = self.lock();
        let known = |id: &str| state.incidents.iter().any(|i| i.id == id);
        if !known(target_id) || !source_ids.iter().all(|id| known(id)) {
            return Err(not_found());
        }
        let now = Utc::now();
        for incident in state
            .incidents
            .iter_mut()
            .filter(|i| source_ids.contains(&i.id))
        {
            incident.status = IncidentStatus::Resolved;
            incident.updated_at = now;
        }
        state
            .actions
            .push(("merge_incidents".to_string(), target_id.to_string()));
        state.senders.push(from.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> MockProvider {
        MockProvider::new()
            .with_user(User::new("U1", "dana@example.com", "Dana"))
            .with_incidents(vec![
                Incident::new("P1", "cpu", "API"),
                Incident::new("P2", "disk", "API").with_status(IncidentStatus::Resolved),
            ])
    }

    #[tokio::test]
    async fn test_failures_are_consumed_in_order() {
        let mock = provider();
        mock.fail_next(2, MockFailure::Network);
        assert!(mock.list_services().await.is_err());
        assert!(mock.list_services().await.is_err());
        assert!(mock.list_services().await.is_ok());
        assert_eq!(mock.calls("list_services"), 3);
    }

    #[tokio::test]
    async fn test_actions_update_listings() {
        let mock = provider();
        mock.acknowledge("P1", "dana@example.com").await.unwrap();
        let open = mock.list_open_incidents(&ListFilter::default()).await.unwrap();
        assert_eq!(open.items[0].status, IncidentStatus::Acknowledged);

        let note = mock.add_note("P1", "dana@example.com", "on it").await.unwrap();
        assert_eq!(note.author, "Dana");
        assert_eq!(mock.actions().len(), 2);

        let err = mock.resolve("P404", "dana@example.com").await.unwrap_err();
        assert!(matches!(err, PagerOpsError::RemoteProtocol { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_assigned_filter() {
        let mut mine = Incident::new("P3", "mine", "API");
        mine.assigned_user_ids = vec!["U1".into()];
        let mock = provider().with_incidents(vec![mine, Incident::new("P4", "theirs", "API")]);
        let page = mock
            .list_open_incidents(&ListFilter::assigned_to("U1"))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "P3");
    }

    #[tokio::test]
    async fn test_snooze_escalate_and_merge() {
        let mock = provider().with_incidents(vec![
            Incident::new("P1", "cpu", "API"),
            Incident::new("P2", "cpu again", "API"),
            Incident::new("P3", "done", "API").with_status(IncidentStatus::Resolved),
        ]);

        mock.snooze("P1", "dana@example.com", Duration::from_secs(600))
            .await
            .unwrap();
        let open = mock.list_open_incidents(&ListFilter::default()).await.unwrap();
        assert_eq!(open.items[0].status, IncidentStatus::Acknowledged);

        mock.escalate("P1", "dana@example.com", 2).await.unwrap();
        let open = mock.list_open_incidents(&ListFilter::default()).await.unwrap();
        assert_eq!(open.items[0].status, IncidentStatus::Triggered);

        let err = mock.snooze("P3", "dana@example.com", Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, PagerOpsError::RemoteProtocol { status: 400, .. }));

        mock.merge_incidents("P1", &["P2".to_string()], "dana@example.com")
            .await
            .unwrap();
        let open = mock.list_open_incidents(&ListFilter::default()).await.unwrap();
        assert_eq!(open.items.len(), 1);
        assert_eq!(
            mock.actions().last(),
            Some(&("merge_incidents".to_string(), "P1".to_string()))
        );
        assert_eq!(mock.senders().len(), 3);
        assert!(mock.senders().iter().all(|s| s == "dana@example.com"));
    }

    #[tokio::test]
    async fn test_alerts_for_known_incident() {
        let alert = Alert {
            id: "A1".into(),
            summary: "CPU > 90%".into(),
            status: "triggered".into(),
            created_at: Utc::now(),
            details: None,
        };
        let mock = provider().with_alerts("P1", vec![alert.clone()]);
        assert_eq!(mock.list_incident_alerts("P1").await.unwrap(), vec![alert]);
        assert!(mock.list_incident_alerts("P2").await.unwrap().is_empty());
        assert!(mock.list_incident_alerts("P404").await.is_err());
    }
}
