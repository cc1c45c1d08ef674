//! Shared entity definitions used across PagerOps crates.
//!
//! These are the records held by the entity store. Remote records arrive in
//! the same shapes with their local-owned fields left at defaults; the
//! reconciler decides which fields survive a merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a service.
pub type ServiceId = String;

/// Identifier of an incident.
pub type IncidentId = String;

/// Identifier of a locally authored template.
pub type TemplateId = i64;

/// The tables held by the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Service,
    Incident,
    User,
    Template,
    DraftNote,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Incident => write!(f, "incident"),
            Self::User => write!(f, "user"),
            Self::Template => write!(f, "template"),
            Self::DraftNote => write!(f, "draft note"),
        }
    }
}

/// Reference to a single stored record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Incident lifecycle status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[default]
    Triggered,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    /// Position on the expected triggered → acknowledged → resolved path.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Triggered => 0,
            Self::Acknowledged => 1,
            Self::Resolved => 2,
        }
    }

    /// Returns true for statuses that live in the open partition.
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "triggered" => Ok(Self::Triggered),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            other => Err(format!("unknown incident status '{}'", other)),
        }
    }
}

/// Incident urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    High,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown urgency '{}'", other)),
        }
    }
}

/// A monitored service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub abbreviation: String,
    /// Local-owned: whether this service counts toward aggregates.
    pub active: bool,
    /// Derived: open incidents of this service, recomputed on every commit.
    pub incident_count: u32,
}

impl Service {
    /// Create an active service with a derived abbreviation.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            abbreviation: abbreviate(&name),
            name,
            active: true,
            incident_count: 0,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Initials of a service name, upper-cased, at most four characters.
pub fn abbreviate(name: &str) -> String {
    let initials: String = name
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter_map(|word| word.chars().next())
        .filter(|c| c.is_alphanumeric())
        .take(4)
        .collect();
    initials.to_uppercase()
}

/// An immutable note attached to an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A cached incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub incident_number: u32,
    pub title: String,
    /// Name of the owning service; aggregation filters on it.
    pub service: String,
    pub service_id: ServiceId,
    pub status: IncidentStatus,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub alert_count: u32,
    /// Seconds until the next escalation, if the provider reported one.
    pub escalates_in: Option<u64>,
    pub description: Option<String>,
    pub notes: Vec<Note>,
    /// Local-owned.
    pub pinned: bool,
    pub assigned_user_ids: Vec<String>,
    pub html_url: Option<String>,
}

impl Incident {
    /// Create a triggered, high-urgency incident created now.
    pub fn new(id: impl Into<String>, title: impl Into<String>, service: impl Into<String>) -> Self {
        let now = Utc::now();
        let service = service.into();
        Self {
            id: id.into(),
            incident_number: 0,
            title: title.into(),
            service_id: service.clone(),
            service,
            status: IncidentStatus::Triggered,
            urgency: Urgency::High,
            created_at: now,
            updated_at: now,
            alert_count: 1,
            escalates_in: None,
            description: None,
            notes: Vec::new(),
            pinned: false,
            assigned_user_ids: Vec::new(),
            html_url: None,
        }
    }

    pub fn with_status(mut self, status: IncidentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// A mirrored provider user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: name.into(),
        }
    }
}

/// One alert grouped under an incident. Fetched on demand, never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub summary: String,
    /// `triggered` or `resolved`, as the provider reports it.
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// Raw event payload, when the provider includes one.
    pub details: Option<serde_json::Value>,
}

/// Reusable note content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Zero until the template has been persisted.
    pub id: TemplateId,
    pub title: String,
    pub body_text: String,
}

/// Work-in-progress note for one incident. Purely local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftNote {
    pub incident_id: IncidentId,
    pub note_text: String,
    pub why_triggered: String,
    pub impact: String,
    pub actions: String,
    pub links: String,
    pub last_updated: DateTime<Utc>,
}

impl DraftNote {
    pub fn empty(incident_id: impl Into<String>) -> Self {
        Self {
            incident_id: incident_id.into(),
            note_text: String::new(),
            why_triggered: String::new(),
            impact: String::new(),
            actions: String::new(),
            links: String::new(),
            last_updated: Utc::now(),
        }
    }

    /// Overwrite only the fields present in `fields`.
    pub fn apply(&mut self, fields: DraftFields) {
        if let Some(v) = fields.note_text {
            self.note_text = v;
        }
        if let Some(v) = fields.why_triggered {
            self.why_triggered = v;
        }
        if let Some(v) = fields.impact {
            self.impact = v;
        }
        if let Some(v) = fields.actions {
            self.actions = v;
        }
        if let Some(v) = fields.links {
            self.links = v;
        }
    }

    /// Render the draft as note content; empty sections are skipped.
    pub fn compose(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.note_text.trim().is_empty() {
            parts.push(self.note_text.trim().to_string());
        }
        for (label, value) in [
            ("Why triggered", &self.why_triggered),
            ("Impact", &self.impact),
            ("Actions", &self.actions),
            ("Links", &self.links),
        ] {
            if !value.trim().is_empty() {
                parts.push(format!("{}: {}", label, value.trim()));
            }
        }
        parts.join("\n\n")
    }
}

/// Partial draft update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftFields {
    pub note_text: Option<String>,
    pub why_triggered: Option<String>,
    pub impact: Option<String>,
    pub actions: Option<String>,
    pub links: Option<String>,
}

impl DraftFields {
    pub fn note_text(mut self, v: impl Into<String>) -> Self {
        self.note_text = Some(v.into());
        self
    }

    pub fn why_triggered(mut self, v: impl Into<String>) -> Self {
        self.why_triggered = Some(v.into());
        self
    }

    pub fn impact(mut self, v: impl Into<String>) -> Self {
        self.impact = Some(v.into());
        self
    }

    pub fn actions(mut self, v: impl Into<String>) -> Self {
        self.actions = Some(v.into());
        self
    }

    pub fn links(mut self, v: impl Into<String>) -> Self {
        self.links = Some(v.into());
        self
    }
}

/// Derived per-status incident counts over active services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub triggered: u32,
    pub acknowledged: u32,
    pub resolved: u32,
}
