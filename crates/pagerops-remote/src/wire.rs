//! PagerDuty REST v2 payloads and their conversion into core types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use pagerops_core::timestamp::{parse_optional_timestamp, parse_timestamp};
use pagerops_core::{
    Alert, Incident, IncidentStatus, Note, PagerOpsError, Result, Service, Urgency, User,
};

#[derive(Debug, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Deserialize)]
pub struct WireUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl From<WireUser> for User {
    fn from(user: WireUser) -> Self {
        User::new(user.id, user.email, user.name)
    }
}

#[derive(Debug, Deserialize)]
pub struct UserEnvelope {
    pub user: WireUser,
}

#[derive(Debug, Deserialize)]
pub struct WireService {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: String,
}

impl From<WireService> for Service {
    fn from(service: WireService) -> Self {
        let name = if service.name.is_empty() {
            service.summary
        } else {
            service.name
        };
        Service::new(service.id, name)
    }
}

#[derive(Debug, Deserialize)]
pub struct Assignment {
    pub assignee: Reference,
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertCounts {
    #[serde(default)]
    pub all: u32,
}

#[derive(Debug, Deserialize)]
pub struct WireIncident {
    pub id: String,
    #[serde(default)]
    pub incident_number: u32,
    #[serde(default)]
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub urgency: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub last_status_change_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub service: Reference,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub alert_counts: Option<AlertCounts>,
}

impl TryFrom<WireIncident> for Incident {
    type Error = PagerOpsError;

    fn try_from(wire: WireIncident) -> Result<Self> {
        let status: IncidentStatus = wire.status.parse().map_err(|e: String| protocol(e))?;
        // Unknown urgencies are treated as high so they are never hidden.
        let urgency = wire
            .urgency
            .as_deref()
            .and_then(|u| u.parse::<Urgency>().ok())
            .unwrap_or(Urgency::High);
        let created_at = parse_timestamp(&wire.created_at)?;
        let updated_at = parse_optional_timestamp(
            wire.last_status_change_at
                .as_deref()
                .or(wire.updated_at.as_deref()),
        )?
        .unwrap_or(created_at);

        let mut incident = Incident::new(wire.id, wire.title, wire.service.summary)
            .with_service_id(wire.service.id)
            .with_status(status)
            .with_urgency(urgency)
            .with_created_at(created_at)
            .with_updated_at(updated_at);
        incident.incident_number = wire.incident_number;
        incident.alert_count = wire.alert_counts.map(|c| c.all).unwrap_or(0);
        incident.description = wire.description.filter(|d| !d.is_empty());
        incident.html_url = wire.html_url;
        incident.assigned_user_ids = wire
            .assignments
            .into_iter()
            .map(|a| a.assignee.id)
            .collect();
        Ok(incident)
    }
}

#[derive(Debug, Deserialize)]
pub struct WireNote {
    #[serde(default)]
    pub user: Option<Reference>,
    pub content: String,
    pub created_at: String,
}

impl TryFrom<WireNote> for Note {
    type Error = PagerOpsError;

    fn try_from(wire: WireNote) -> Result<Self> {
        Ok(Note {
            author: wire.user.map(|u| u.summary).unwrap_or_default(),
            content: wire.content,
            timestamp: parse_timestamp(&wire.created_at)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct NoteEnvelope {
    pub note: WireNote,
}

#[derive(Debug, Deserialize)]
pub struct WireAlert {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: String,
    pub created_at: String,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

impl TryFrom<WireAlert> for Alert {
    type Error = PagerOpsError;

    fn try_from(wire: WireAlert) -> Result<Self> {
        Ok(Alert {
            id: wire.id,
            summary: wire.summary,
            status: wire.status,
            created_at: parse_timestamp(&wire.created_at)?,
            details: wire.body.filter(|b| !b.is_null()),
        })
    }
}

/// Body of `PUT /incidents`.
#[derive(Debug, Serialize)]
pub struct StatusUpdate<'a> {
    pub incidents: Vec<IncidentReference<'a>>,
}

#[derive(Debug, Serialize)]
pub struct IncidentReference<'a> {
    pub id: &'a str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_level: Option<u32>,
}

impl<'a> IncidentReference<'a> {
    fn new(id: &'a str) -> Self {
        Self {
            id,
            kind: "incident_reference",
            status: None,
            escalation_level: None,
        }
    }
}

impl<'a> StatusUpdate<'a> {
    pub fn single(id: &'a str, status: IncidentStatus) -> Self {
        Self {
            incidents: vec![IncidentReference {
                status: Some(status.as_str()),
                ..IncidentReference::new(id)
            }],
        }
    }

    pub fn escalate(id: &'a str, level: u32) -> Self {
        Self {
            incidents: vec![IncidentReference {
                escalation_level: Some(level),
                ..IncidentReference::new(id)
            }],
        }
    }
}

/// Body of `POST /incidents/{id}/snooze`.
#[derive(Debug, Serialize)]
pub struct Snooze {
    /// Seconds.
    pub duration: u64,
}

/// Body of `PUT /incidents/{id}/merge`.
#[derive(Debug, Serialize)]
pub struct Merge<'a> {
    pub source_incidents: Vec<IncidentReference<'a>>,
}

impl<'a> Merge<'a> {
    pub fn from_sources(source_ids: &'a [String]) -> Self {
        Self {
            source_incidents: source_ids
                .iter()
                .map(|id| IncidentReference::new(id.as_str()))
                .collect(),
        }
    }
}

/// Body of `POST /incidents/{id}/notes`.
#[derive(Debug, Serialize)]
pub struct NewNote<'a> {
    pub note: NoteContent<'a>,
}

#[derive(Debug, Serialize)]
pub struct NoteContent<'a> {
    pub content: &'a str,
}

/// One page of a classic offset-paginated listing.
#[derive(Debug)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub more: bool,
}

/// Decode a listing whose records live under `key`.
pub fn decode_list<T: DeserializeOwned>(body: &str, key: &str) -> Result<ListPage<T>> {
    let mut value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| protocol(format!("invalid {} listing: {}", key, e)))?;
    let more = value.get("more").and_then(|m| m.as_bool()).unwrap_or(false);
    let records = value
        .get_mut(key)
        .map(serde_json::Value::take)
        .ok_or_else(|| protocol(format!("listing has no '{}' field", key)))?;
    let items = serde_json::from_value(records)
        .map_err(|e| protocol(format!("invalid {} record: {}", key, e)))?;
    Ok(ListPage { items, more })
}

/// Decode a single-object response.
pub fn decode<T: DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| protocol(format!("invalid {}: {}", what, e)))
}

fn protocol(message: impl Into<String>) -> PagerOpsError {
    PagerOpsError::RemoteProtocol {
        status: 200,
        message: message.into(),
    }
}
