//! In-memory entity tables.
//!
//! [`EntityStore`] is the single source of truth for services, incidents,
//! users, templates and drafts. It is not synchronized itself: the owning
//! [`SyncCache`](crate::cache::SyncCache) wraps it in a mutex and commits the
//! recorded changes of one critical section as a single batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use pagerops_core::{
    DraftNote, EntityKind, EntityRef, Incident, IncidentId, IncidentStatus, Note, PagerOpsError,
    Result, Service, ServiceId, Template, TemplateId, User,
};

use crate::aggregate;
use crate::ownership::{self, StatusResolution};
use crate::persist::LocalOverrides;

/// Any record the store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Service(Service),
    Incident(Incident),
    User(User),
    Template(Template),
    DraftNote(DraftNote),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Service(_) => EntityKind::Service,
            Self::Incident(_) => EntityKind::Incident,
            Self::User(_) => EntityKind::User,
            Self::Template(_) => EntityKind::Template,
            Self::DraftNote(_) => EntityKind::DraftNote,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Service(s) => s.id.clone(),
            Self::Incident(i) => i.id.clone(),
            Self::User(u) => u.id.clone(),
            Self::Template(t) => t.id.to_string(),
            Self::DraftNote(d) => d.incident_id.clone(),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id())
    }
}

/// Result of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Updated,
    /// Updated and crossed between the open and resolved partitions.
    Moved,
    Unchanged,
}

impl WriteOutcome {
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A locally applied status change awaiting remote confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStatus {
    pub status: IncidentStatus,
    pub previous: IncidentStatus,
    pub issued_at: DateTime<Utc>,
}

impl PendingStatus {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.issued_at >= ttl
    }
}

/// Entity tables plus the change list of the current critical section.
#[derive(Debug)]
pub struct EntityStore {
    services: BTreeMap<ServiceId, Service>,
    open: BTreeMap<IncidentId, Incident>,
    resolved: BTreeMap<IncidentId, Incident>,
    users: BTreeMap<String, User>,
    current_user: Option<User>,
    templates: BTreeMap<TemplateId, Template>,
    drafts: BTreeMap<IncidentId, DraftNote>,
    pending: HashMap<IncidentId, PendingStatus>,
    overrides: LocalOverrides,
    pending_ttl: chrono::Duration,
    changes: BTreeSet<EntityRef>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new(chrono::Duration::seconds(60))
    }
}

impl EntityStore {
    pub fn new(pending_ttl: chrono::Duration) -> Self {
        Self {
            services: BTreeMap::new(),
            open: BTreeMap::new(),
            resolved: BTreeMap::new(),
            users: BTreeMap::new(),
            current_user: None,
            templates: BTreeMap::new(),
            drafts: BTreeMap::new(),
            pending: HashMap::new(),
            overrides: LocalOverrides::default(),
            pending_ttl,
            changes: BTreeSet::new(),
        }
    }

    /// Seed persisted local overrides, applying them to known records.
    pub fn seed_overrides(&mut self, overrides: LocalOverrides) {
        for (id, active) in &overrides.service_active {
            if let Some(service) = self.services.get_mut(id)
                && service.active != *active
            {
                service.active = *active;
                self.changes.insert(EntityRef::new(EntityKind::Service, id.clone()));
            }
        }
        for id in &overrides.pinned_incidents {
            if let Some(incident) = self.incident_mut(id)
                && !incident.pinned
            {
                incident.pinned = true;
                self.changes.insert(EntityRef::new(EntityKind::Incident, id.clone()));
            }
        }
        self.overrides = overrides;
    }

    // =========================================================================
    // Generic contract
    // =========================================================================

    /// Insert or merge a record. Never fails.
    ///
    /// Remote-backed kinds merge through the ownership table, so local-owned
    /// fields of an existing record survive. Templates and drafts are local
    /// records and are replaced wholesale.
    pub fn upsert(&mut self, entity: Entity) -> WriteOutcome {
        self.upsert_at(entity, Utc::now())
    }

    pub(crate) fn upsert_at(&mut self, entity: Entity, now: DateTime<Utc>) -> WriteOutcome {
        let entity_ref = entity.entity_ref();
        let outcome = match entity {
            Entity::Service(service) => self.upsert_service(service),
            Entity::Incident(incident) => self.upsert_incident(incident, now),
            Entity::User(user) => self.upsert_user(user),
            Entity::Template(template) => {
                replace(&mut self.templates, template.id, template)
            }
            Entity::DraftNote(draft) => {
                replace(&mut self.drafts, draft.incident_id.clone(), draft)
            }
        };
        if outcome.is_change() {
            self.changes.insert(entity_ref);
        }
        outcome
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        match kind {
            EntityKind::Service => self.services.get(id).cloned().map(Entity::Service),
            EntityKind::Incident => self.incident(id).cloned().map(Entity::Incident),
            EntityKind::User => self.users.get(id).cloned().map(Entity::User),
            EntityKind::Template => id
                .parse::<TemplateId>()
                .ok()
                .and_then(|tid| self.templates.get(&tid))
                .cloned()
                .map(Entity::Template),
            EntityKind::DraftNote => self.drafts.get(id).cloned().map(Entity::DraftNote),
        }
    }

    /// Open incidents: pinned first, then newest first.
    pub fn list_open(&self) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self.open.values().cloned().collect();
        incidents.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.id.cmp(&b.id))
        });
        incidents
    }

    /// Resolved incidents, newest first.
    pub fn list_resolved(&self) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self.resolved.values().cloned().collect();
        incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        incidents
    }

    pub fn delete(&mut self, kind: EntityKind, id: &str) -> Result<Entity> {
        let removed = match kind {
            EntityKind::Service => self.services.remove(id).map(Entity::Service),
            EntityKind::Incident => {
                self.pending.remove(id);
                self.open
                    .remove(id)
                    .or_else(|| self.resolved.remove(id))
                    .map(Entity::Incident)
            }
            EntityKind::User => self.users.remove(id).map(Entity::User),
            EntityKind::Template => id
                .parse::<TemplateId>()
                .ok()
                .and_then(|tid| self.templates.remove(&tid))
                .map(Entity::Template),
            EntityKind::DraftNote => self.drafts.remove(id).map(Entity::DraftNote),
        };
        let entity = removed.ok_or_else(|| PagerOpsError::not_found(kind, id))?;
        self.changes.insert(EntityRef::new(kind, id));
        Ok(entity)
    }

    // =========================================================================
    // Typed reads
    // =========================================================================

    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.values().cloned().collect()
    }

    pub fn incident(&self, id: &str) -> Option<&Incident> {
        self.open.get(id).or_else(|| self.resolved.get(id))
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.open.contains_key(id)
    }

    pub fn open_ids(&self) -> Vec<IncidentId> {
        self.open.keys().cloned().collect()
    }

    pub fn user(&self, id: &str) -> Option<&User> {
        self.users.get(id)
    }

    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    pub fn draft(&self, incident_id: &str) -> Option<&DraftNote> {
        self.drafts.get(incident_id)
    }

    pub fn draft_ids(&self) -> BTreeSet<IncidentId> {
        self.drafts.keys().cloned().collect()
    }

    pub fn drafts(&self) -> Vec<DraftNote> {
        self.drafts.values().cloned().collect()
    }

    pub fn templates(&self) -> Vec<Template> {
        self.templates.values().cloned().collect()
    }

    pub fn pending(&self, id: &str) -> Option<&PendingStatus> {
        self.pending.get(id)
    }

    // =========================================================================
    // Local mutations (update-only: unknown ids fail with NotFound)
    // =========================================================================

    /// Returns whether the flag changed.
    pub fn set_service_active(&mut self, id: &str, active: bool) -> Result<bool> {
        let service = self
            .services
            .get_mut(id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Service, id))?;
        self.overrides.service_active.insert(id.to_string(), active);
        if service.active == active {
            return Ok(false);
        }
        service.active = active;
        self.changes.insert(EntityRef::new(EntityKind::Service, id));
        Ok(true)
    }

    /// Returns whether the flag changed.
    pub fn set_incident_pinned(&mut self, id: &str, pinned: bool) -> Result<bool> {
        let incident = self
            .incident_mut(id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Incident, id))?;
        let changed = incident.pinned != pinned;
        incident.pinned = pinned;
        if pinned {
            self.overrides.pinned_incidents.insert(id.to_string());
        } else {
            self.overrides.pinned_incidents.remove(id);
        }
        if changed {
            self.changes.insert(EntityRef::new(EntityKind::Incident, id));
        }
        Ok(changed)
    }

    pub fn append_note(&mut self, id: &str, note: Note) -> Result<()> {
        let incident = self
            .incident_mut(id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Incident, id))?;
        incident.notes.push(note);
        self.changes.insert(EntityRef::new(EntityKind::Incident, id));
        Ok(())
    }

    /// Apply a status locally and shield it from stale remote data.
    pub fn set_pending_status(&mut self, id: &str, status: IncidentStatus) -> Result<()> {
        self.set_pending_status_at(id, status, Utc::now())
    }

    pub(crate) fn set_pending_status_at(
        &mut self,
        id: &str,
        status: IncidentStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut incident = self
            .take_incident(id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Incident, id))?;
        // Keep the oldest known remote status for a revert.
        let previous = self
            .pending
            .get(id)
            .map(|p| p.previous)
            .unwrap_or(incident.status);
        self.pending.insert(
            id.to_string(),
            PendingStatus {
                status,
                previous,
                issued_at: now,
            },
        );
        incident.status = status;
        self.place_incident(incident);
        self.changes.insert(EntityRef::new(EntityKind::Incident, id));
        Ok(())
    }

    /// Drop a pending status, optionally restoring the status it replaced.
    pub fn clear_pending(&mut self, id: &str, revert: bool) -> Result<()> {
        if self.incident(id).is_none() {
            return Err(PagerOpsError::not_found(EntityKind::Incident, id));
        }
        let Some(pending) = self.pending.remove(id) else {
            return Ok(());
        };
        if revert
            && let Some(mut incident) = self.take_incident(id)
        {
            let changed = incident.status != pending.previous;
            incident.status = pending.previous;
            self.place_incident(incident);
            if changed {
                self.changes.insert(EntityRef::new(EntityKind::Incident, id));
            }
        }
        Ok(())
    }

    /// Remove resolved incidents last updated before `cutoff`.
    ///
    /// Pinned incidents, incidents with a draft and incidents with a
    /// pending status are kept.
    pub fn prune_resolved(&mut self, cutoff: DateTime<Utc>) -> Vec<IncidentId> {
        let doomed: Vec<IncidentId> = self
            .resolved
            .values()
            .filter(|i| {
                i.updated_at < cutoff
                    && !i.pinned
                    && !self.drafts.contains_key(&i.id)
                    && !self.pending.contains_key(&i.id)
            })
            .map(|i| i.id.clone())
            .collect();
        for id in &doomed {
            self.resolved.remove(id);
            self.pending.remove(id);
            self.changes.insert(EntityRef::new(EntityKind::Incident, id.clone()));
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "pruned resolved incidents");
        }
        doomed
    }

    pub fn set_current_user(&mut self, user: Option<User>) {
        if self.current_user != user {
            if let Some(u) = &user {
                self.changes.insert(EntityRef::new(EntityKind::User, u.id.clone()));
            }
            self.current_user = user;
        }
    }

    // =========================================================================
    // Commit support
    // =========================================================================

    /// Recompute derived fields. Called once per commit.
    pub fn recompute_derived(&mut self) {
        let counts = aggregate::open_counts_by_service(self.open.values());
        for service in self.services.values_mut() {
            let count = counts.get(service.name.as_str()).copied().unwrap_or(0);
            if service.incident_count != count {
                service.incident_count = count;
                self.changes
                    .insert(EntityRef::new(EntityKind::Service, service.id.clone()));
            }
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn take_changes(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.changes).into_iter().collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn upsert_service(&mut self, remote: Service) -> WriteOutcome {
        match self.services.get(&remote.id) {
            Some(local) => {
                let merged = ownership::merge_service(local, &remote);
                replace(&mut self.services, merged.id.clone(), merged)
            }
            None => {
                let mut service = remote;
                if let Some(active) = self.overrides.service_active(&service.id) {
                    service.active = active;
                }
                self.services.insert(service.id.clone(), service);
                WriteOutcome::Inserted
            }
        }
    }

    fn upsert_user(&mut self, remote: User) -> WriteOutcome {
        match self.users.get(&remote.id) {
            Some(local) => {
                let merged = ownership::merge_user(local, &remote);
                replace(&mut self.users, merged.id.clone(), merged)
            }
            None => {
                self.users.insert(remote.id.clone(), remote);
                WriteOutcome::Inserted
            }
        }
    }

    fn upsert_incident(&mut self, remote: Incident, now: DateTime<Utc>) -> WriteOutcome {
        let Some(local) = self.incident(&remote.id).cloned() else {
            let mut incident = remote;
            incident.pinned = self.overrides.is_pinned(&incident.id);
            self.place_incident(incident);
            return WriteOutcome::Inserted;
        };

        let resolution =
            ownership::resolve_status(remote.status, self.pending.get(&local.id), now, self.pending_ttl);
        if resolution != StatusResolution::Shielded && self.pending.remove(&local.id).is_some() {
            debug!(incident_id = %local.id, ?resolution, "pending status settled");
        }

        let merged = ownership::merge_incident(&local, &remote, resolution);
        if merged == local {
            return WriteOutcome::Unchanged;
        }
        let moved = merged.is_open() != local.is_open();
        self.take_incident(&local.id);
        self.place_incident(merged);
        if moved {
            WriteOutcome::Moved
        } else {
            WriteOutcome::Updated
        }
    }

    fn incident_mut(&mut self, id: &str) -> Option<&mut Incident> {
        match self.open.get_mut(id) {
            Some(incident) => Some(incident),
            None => self.resolved.get_mut(id),
        }
    }

    fn take_incident(&mut self, id: &str) -> Option<Incident> {
        self.open.remove(id).or_else(|| self.resolved.remove(id))
    }

    /// Insert into the partition matching the incident's status.
    fn place_incident(&mut self, incident: Incident) {
        if incident.is_open() {
            self.open.insert(incident.id.clone(), incident);
        } else {
            self.resolved.insert(incident.id.clone(), incident);
        }
    }
}

fn replace<K: Ord, V: PartialEq>(table: &mut BTreeMap<K, V>, key: K, value: V) -> WriteOutcome {
    match table.get(&key) {
        Some(existing) if *existing == value => WriteOutcome::Unchanged,
        Some(_) => {
            table.insert(key, value);
            WriteOutcome::Updated
        }
        None => {
            table.insert(key, value);
            WriteOutcome::Inserted
        }
    }
}
