//! Per-field ownership table.
//!
//! Every field of every remote-backed entity has exactly one owner. The merge
//! functions below walk the table instead of hand-picking fields, so adding a
//! field without classifying it fails to compile (the `match` arms are
//! exhaustive) rather than silently losing local data.

use chrono::{DateTime, Utc};

use pagerops_core::{Incident, IncidentStatus, Note, Service, User};

use crate::store::PendingStatus;

/// Who decides a field's value during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The key; never changes.
    Identity,
    /// Remote value always wins.
    Remote,
    /// Only local mutations set it; reconciliation preserves it.
    Local,
    /// Remote wins unless a local optimistic change is pending.
    RemoteUnlessPending,
    /// Remote values plus local values the remote does not have yet.
    Union,
    /// Recomputed on every commit; never merged.
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceField {
    Id,
    Name,
    Abbreviation,
    Active,
    IncidentCount,
}

impl ServiceField {
    pub const ALL: [ServiceField; 5] = [
        Self::Id,
        Self::Name,
        Self::Abbreviation,
        Self::Active,
        Self::IncidentCount,
    ];

    pub fn owner(self) -> Owner {
        match self {
            Self::Id => Owner::Identity,
            Self::Name | Self::Abbreviation => Owner::Remote,
            Self::Active => Owner::Local,
            Self::IncidentCount => Owner::Derived,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentField {
    Id,
    IncidentNumber,
    Title,
    Service,
    ServiceId,
    Status,
    Urgency,
    CreatedAt,
    UpdatedAt,
    AlertCount,
    EscalatesIn,
    Description,
    Notes,
    Pinned,
    AssignedUserIds,
    HtmlUrl,
}

impl IncidentField {
    pub const ALL: [IncidentField; 16] = [
        Self::Id,
        Self::IncidentNumber,
        Self::Title,
        Self::Service,
        Self::ServiceId,
        Self::Status,
        Self::Urgency,
        Self::CreatedAt,
        Self::UpdatedAt,
        Self::AlertCount,
        Self::EscalatesIn,
        Self::Description,
        Self::Notes,
        Self::Pinned,
        Self::AssignedUserIds,
        Self::HtmlUrl,
    ];

    pub fn owner(self) -> Owner {
        match self {
            Self::Id => Owner::Identity,
            Self::IncidentNumber
            | Self::Title
            | Self::Service
            | Self::ServiceId
            | Self::Urgency
            | Self::CreatedAt
            | Self::UpdatedAt
            | Self::AlertCount
            | Self::EscalatesIn
            | Self::Description
            | Self::AssignedUserIds
            | Self::HtmlUrl => Owner::Remote,
            Self::Status => Owner::RemoteUnlessPending,
            Self::Notes => Owner::Union,
            Self::Pinned => Owner::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    Id,
    Email,
    Name,
}

impl UserField {
    pub const ALL: [UserField; 3] = [Self::Id, Self::Email, Self::Name];

    pub fn owner(self) -> Owner {
        match self {
            Self::Id => Owner::Identity,
            Self::Email | Self::Name => Owner::Remote,
        }
    }
}

/// How a remote status interacts with a pending local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusResolution {
    /// No live pending entry; take the remote status.
    Remote,
    /// Remote caught up with (or overtook) the pending status; take it and
    /// drop the pending entry.
    Confirmed,
    /// Remote is behind the pending status; keep the local one.
    Shielded,
}

impl StatusResolution {
    pub fn keeps_local(self) -> bool {
        matches!(self, Self::Shielded)
    }
}

/// Decide whether a remote status may overwrite the local one.
pub fn resolve_status(
    remote: IncidentStatus,
    pending: Option<&PendingStatus>,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> StatusResolution {
    match pending {
        None => StatusResolution::Remote,
        Some(p) if p.is_expired(now, ttl) => StatusResolution::Remote,
        Some(p) if remote.rank() >= p.status.rank() => StatusResolution::Confirmed,
        Some(_) => StatusResolution::Shielded,
    }
}

pub fn merge_service(local: &Service, remote: &Service) -> Service {
    let mut merged = local.clone();
    for field in ServiceField::ALL {
        if field.owner() != Owner::Remote {
            continue;
        }
        match field {
            ServiceField::Name => merged.name = remote.name.clone(),
            ServiceField::Abbreviation => merged.abbreviation = remote.abbreviation.clone(),
            ServiceField::Id | ServiceField::Active | ServiceField::IncidentCount => {}
        }
    }
    merged
}

pub fn merge_user(local: &User, remote: &User) -> User {
    let mut merged = local.clone();
    for field in UserField::ALL {
        if field.owner() != Owner::Remote {
            continue;
        }
        match field {
            UserField::Email => merged.email = remote.email.clone(),
            UserField::Name => merged.name = remote.name.clone(),
            UserField::Id => {}
        }
    }
    merged
}

pub fn merge_incident(local: &Incident, remote: &Incident, status: StatusResolution) -> Incident {
    let mut merged = local.clone();
    for field in IncidentField::ALL {
        match field.owner() {
            Owner::Remote => take_remote_incident_field(field, &mut merged, remote),
            Owner::RemoteUnlessPending => {
                if !status.keeps_local() {
                    take_remote_incident_field(field, &mut merged, remote);
                }
            }
            Owner::Union => merged.notes = union_notes(&remote.notes, &local.notes),
            Owner::Identity | Owner::Local | Owner::Derived => {}
        }
    }
    merged
}

fn take_remote_incident_field(field: IncidentField, merged: &mut Incident, remote: &Incident) {
    match field {
        IncidentField::IncidentNumber => merged.incident_number = remote.incident_number,
        IncidentField::Title => merged.title = remote.title.clone(),
        IncidentField::Service => merged.service = remote.service.clone(),
        IncidentField::ServiceId => merged.service_id = remote.service_id.clone(),
        IncidentField::Status => merged.status = remote.status,
        IncidentField::Urgency => merged.urgency = remote.urgency,
        IncidentField::CreatedAt => merged.created_at = remote.created_at,
        IncidentField::UpdatedAt => merged.updated_at = remote.updated_at,
        IncidentField::AlertCount => merged.alert_count = remote.alert_count,
        IncidentField::EscalatesIn => merged.escalates_in = remote.escalates_in,
        IncidentField::Description => merged.description = remote.description.clone(),
        IncidentField::AssignedUserIds => merged.assigned_user_ids = remote.assigned_user_ids.clone(),
        IncidentField::HtmlUrl => merged.html_url = remote.html_url.clone(),
        IncidentField::Id | IncidentField::Notes | IncidentField::Pinned => {}
    }
}

/// Remote notes, then local notes whose content the remote does not have,
/// ordered by timestamp.
pub fn union_notes(remote: &[Note], local: &[Note]) -> Vec<Note> {
    let mut notes: Vec<Note> = remote.to_vec();
    for note in local {
        let known = remote
            .iter()
            .any(|r| r.content.trim() == note.content.trim());
        if !known {
            notes.push(note.clone());
        }
    }
    notes.sort_by_key(|n| n.timestamp);
    notes
}
