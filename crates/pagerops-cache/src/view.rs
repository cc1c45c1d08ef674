//! Presentation-side view state.
//!
//! Selection, search, filter and tab live outside the entity store: they are
//! per-view and never persisted. Everything is evaluated against a snapshot.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use pagerops_core::{EntityKind, Incident, IncidentId, IncidentStatus, PagerOpsError, Result, Urgency};

use crate::cache::CacheSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tab {
    #[default]
    Open,
    Resolved,
}

/// Keyword filter applied on top of the search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentFilter {
    #[default]
    All,
    Status(IncidentStatus),
    Urgency(Urgency),
}

impl IncidentFilter {
    pub fn matches(&self, incident: &Incident) -> bool {
        match self {
            Self::All => true,
            Self::Status(status) => incident.status == *status,
            Self::Urgency(urgency) => incident.urgency == *urgency,
        }
    }
}

impl FromStr for IncidentFilter {
    type Err = PagerOpsError;

    fn from_str(s: &str) -> Result<Self> {
        let keyword = s.trim().to_ascii_lowercase();
        if keyword.is_empty() || keyword == "all" {
            return Ok(Self::All);
        }
        if let Ok(status) = keyword.parse::<IncidentStatus>() {
            return Ok(Self::Status(status));
        }
        if let Ok(urgency) = keyword.parse::<Urgency>() {
            return Ok(Self::Urgency(urgency));
        }
        Err(PagerOpsError::validation(
            "filter",
            format!("unknown filter keyword '{}'", s),
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    selected: Option<IncidentId>,
    search: String,
    filter: IncidentFilter,
    tab: Tab,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select an incident present in `snapshot`.
    pub fn select_incident(&mut self, snapshot: &CacheSnapshot, id: &str) -> Result<()> {
        if snapshot.incident(id).is_none() {
            return Err(PagerOpsError::not_found(EntityKind::Incident, id));
        }
        self.selected = Some(id.to_string());
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// The selected incident, if it is still in the snapshot.
    pub fn selected_incident<'a>(&self, snapshot: &'a CacheSnapshot) -> Option<&'a Incident> {
        self.selected.as_deref().and_then(|id| snapshot.incident(id))
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn set_search(&mut self, query: impl Into<String>) {
        self.search = query.into();
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn set_filter(&mut self, filter: IncidentFilter) {
        self.filter = filter;
    }

    pub fn filter(&self) -> IncidentFilter {
        self.filter
    }

    pub fn set_tab(&mut self, tab: Tab) {
        self.tab = tab;
    }

    pub fn tab(&self) -> Tab {
        self.tab
    }

    /// Incidents of the active tab matching the search query and filter,
    /// in snapshot order.
    pub fn visible_incidents<'a>(&self, snapshot: &'a CacheSnapshot) -> Vec<&'a Incident> {
        let source = match self.tab {
            Tab::Open => &snapshot.open,
            Tab::Resolved => &snapshot.resolved,
        };
        let query = self.search.trim().to_lowercase();
        source
            .iter()
            .filter(|i| self.filter.matches(i))
            .filter(|i| query.is_empty() || matches_query(i, &query))
            .collect()
    }
}

fn matches_query(incident: &Incident, query: &str) -> bool {
    incident.title.to_lowercase().contains(query)
        || incident.service.to_lowercase().contains(query)
        || incident.incident_number.to_string().contains(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SyncCache;
    use crate::reconcile::RemoteBatch;
    use pagerops_core::Service;

    fn snapshot() -> std::sync::Arc<CacheSnapshot> {
        let cache = SyncCache::default();
        let mut db = Incident::new("P1", "Database latency", "Storage");
        db.incident_number = 1042;
        let web = Incident::new("P2", "5xx spike", "Checkout Web")
            .with_status(IncidentStatus::Acknowledged)
            .with_urgency(Urgency::Low);
        let old = Incident::new("P3", "Cert expiry", "Edge").with_status(IncidentStatus::Resolved);
        cache.apply_remote_batch(RemoteBatch {
            services: vec![Service::new("S1", "Storage")],
            open_incidents: vec![db, web],
            resolved_incidents: vec![old],
            ..RemoteBatch::default()
        });
        cache.snapshot()
    }

    fn ids(incidents: Vec<&Incident>) -> Vec<&str> {
        let mut ids: Vec<&str> = incidents.iter().map(|i| i.id.as_str()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_search_matches_title_service_and_number() {
        let snapshot = snapshot();
        let mut view = ViewState::new();
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P1", "P2"]);

        view.set_search("LATENCY");
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P1"]);
        view.set_search("checkout");
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P2"]);
        view.set_search("1042");
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P1"]);
    }

    #[test]
    fn test_filter_and_tab() {
        let snapshot = snapshot();
        let mut view = ViewState::new();
        view.set_filter("acknowledged".parse().unwrap());
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P2"]);
        view.set_filter("high".parse().unwrap());
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P1"]);
        assert!("sideways".parse::<IncidentFilter>().is_err());

        view.set_filter(IncidentFilter::All);
        view.set_tab(Tab::Resolved);
        assert_eq!(ids(view.visible_incidents(&snapshot)), vec!["P3"]);
    }

    #[test]
    fn test_selection_requires_known_incident() {
        let snapshot = snapshot();
        let mut view = ViewState::new();
        let err = view.select_incident(&snapshot, "P404").unwrap_err();
        assert!(matches!(err, PagerOpsError::NotFound { .. }));
        assert!(view.selected_id().is_none());

        view.select_incident(&snapshot, "P3").unwrap();
        assert_eq!(view.selected_incident(&snapshot).unwrap().title, "Cert expiry");
    }
}
