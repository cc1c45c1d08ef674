//! Remote reconciliation.
//!
//! Merges one polling cycle's worth of remote records into the store. The
//! caller holds the cache lock for the whole call, so the batch lands as one
//! commit.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use pagerops_core::{EntityKind, EntityRef, Incident, IncidentId, IncidentStatus, Service, User};

use crate::store::{Entity, EntityStore, WriteOutcome};

/// Records fetched in one polling cycle.
#[derive(Debug, Clone, Default)]
pub struct RemoteBatch {
    pub services: Vec<Service>,
    pub open_incidents: Vec<Incident>,
    pub resolved_incidents: Vec<Incident>,
    pub users: Vec<User>,
    pub current_user: Option<User>,
    /// True only when every listing was read to the end.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Resolve known open incidents missing from a complete open listing.
    pub infer_resolution: bool,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub changed: BTreeSet<EntityRef>,
    pub inserted: usize,
    pub updated: usize,
    /// Incidents that crossed between open and resolved.
    pub moved: usize,
    /// Open incidents resolved because they vanished from a complete listing.
    pub inferred_resolved: Vec<IncidentId>,
    /// Incidents first seen as triggered, or that re-entered triggered.
    pub newly_triggered: Vec<IncidentId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    fn record(&mut self, entity_ref: EntityRef, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Moved => {
                self.updated += 1;
                self.moved += 1;
            }
            WriteOutcome::Unchanged => return,
        }
        self.changed.insert(entity_ref);
    }
}

/// Merge `batch` into `store`.
pub fn reconcile(
    store: &mut EntityStore,
    batch: RemoteBatch,
    options: ReconcileOptions,
    now: DateTime<Utc>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    if let Some(user) = batch.current_user.clone() {
        store.set_current_user(Some(user));
    }
    for service in batch.services {
        let entity_ref = EntityRef::new(EntityKind::Service, service.id.clone());
        let outcome = store.upsert_at(Entity::Service(service), now);
        report.record(entity_ref, outcome);
    }
    for user in batch.users {
        let entity_ref = EntityRef::new(EntityKind::User, user.id.clone());
        let outcome = store.upsert_at(Entity::User(user), now);
        report.record(entity_ref, outcome);
    }

    let remote_open: HashSet<IncidentId> =
        batch.open_incidents.iter().map(|i| i.id.clone()).collect();
    let remote_resolved: HashSet<IncidentId> =
        batch.resolved_incidents.iter().map(|i| i.id.clone()).collect();

    for incident in newest_per_id(batch.open_incidents, batch.resolved_incidents) {
        let id = incident.id.clone();
        let before = store.incident(&id).map(|i| i.status);
        let outcome = store.upsert_at(Entity::Incident(incident), now);
        let after = store.incident(&id).map(|i| i.status);
        if after == Some(IncidentStatus::Triggered) && before != Some(IncidentStatus::Triggered) {
            report.newly_triggered.push(id.clone());
        }
        report.record(EntityRef::new(EntityKind::Incident, id), outcome);
    }

    // Vanished open incidents are ambiguous: never deleted, and resolved only
    // when the listing is known to be complete and inference is enabled.
    let vanished: Vec<IncidentId> = store
        .open_ids()
        .into_iter()
        .filter(|id| !remote_open.contains(id) && !remote_resolved.contains(id))
        .collect();
    if !vanished.is_empty() {
        if batch.complete && options.infer_resolution {
            for id in vanished {
                if store.pending(&id).is_some() {
                    continue;
                }
                let Some(mut incident) = store.incident(&id).cloned() else {
                    continue;
                };
                incident.status = IncidentStatus::Resolved;
                incident.updated_at = now;
                let outcome = store.upsert_at(Entity::Incident(incident), now);
                report.record(EntityRef::new(EntityKind::Incident, id.clone()), outcome);
                report.inferred_resolved.push(id);
            }
        } else {
            debug!(
                count = vanished.len(),
                complete = batch.complete,
                "keeping open incidents missing from remote listing"
            );
        }
    }

    if !report.is_empty() {
        info!(
            inserted = report.inserted,
            updated = report.updated,
            moved = report.moved,
            inferred = report.inferred_resolved.len(),
            newly_triggered = report.newly_triggered.len(),
            "reconciled remote batch"
        );
    }
    report
}

/// Collapse the open and resolved listings to one record per id.
///
/// The two listings are fetched concurrently, so an incident resolved
/// between them can appear in both. The later `updated_at` wins; on a tie
/// the status further along the lifecycle wins.
fn newest_per_id(open: Vec<Incident>, resolved: Vec<Incident>) -> Vec<Incident> {
    let mut by_id: BTreeMap<IncidentId, Incident> = BTreeMap::new();
    for incident in resolved.into_iter().chain(open) {
        match by_id.get(&incident.id) {
            Some(existing)
                if (existing.updated_at, existing.status.rank())
                    >= (incident.updated_at, incident.status.rank()) => {}
            _ => {
                by_id.insert(incident.id.clone(), incident);
            }
        }
    }
    by_id.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pagerops_core::DraftNote;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn incident(id: &str, status: IncidentStatus, hour: u32) -> Incident {
        Incident::new(id, format!("incident {id}"), "API")
            .with_status(status)
            .with_created_at(ts(hour))
    }

    fn batch() -> RemoteBatch {
        RemoteBatch {
            services: vec![Service::new("S1", "API"), Service::new("S2", "Web")],
            open_incidents: vec![
                incident("P1", IncidentStatus::Triggered, 1),
                incident("P2", IncidentStatus::Acknowledged, 2),
            ],
            resolved_incidents: vec![incident("P3", IncidentStatus::Resolved, 3)],
            users: vec![User::new("U1", "dana@example.com", "Dana")],
            current_user: Some(User::new("U1", "dana@example.com", "Dana")),
            complete: true,
        }
    }

    #[test]
    fn test_first_merge_inserts_everything() {
        let mut store = EntityStore::default();
        let report = reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));
        assert_eq!(report.inserted, 6);
        assert_eq!(report.newly_triggered, vec!["P1".to_string()]);
        assert_eq!(store.list_open().len(), 2);
        assert_eq!(store.list_resolved().len(), 1);
        assert_eq!(store.current_user().map(|u| u.id.as_str()), Some("U1"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut once = EntityStore::default();
        reconcile(&mut once, batch(), ReconcileOptions::default(), ts(4));

        let mut twice = EntityStore::default();
        reconcile(&mut twice, batch(), ReconcileOptions::default(), ts(4));
        twice.take_changes();
        let report = reconcile(&mut twice, batch(), ReconcileOptions::default(), ts(4));

        assert!(report.is_empty());
        assert!(report.newly_triggered.is_empty());
        assert!(!twice.has_changes());
        assert_eq!(once.list_open(), twice.list_open());
        assert_eq!(once.list_resolved(), twice.list_resolved());
        assert_eq!(once.services(), twice.services());
        assert_eq!(once.users(), twice.users());
    }

    #[test]
    fn test_local_fields_never_overwritten() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));
        store.set_service_active("S1", false).unwrap();
        store.set_incident_pinned("P1", true).unwrap();
        store.upsert(Entity::DraftNote(DraftNote::empty("P2")));

        for round in 0..3 {
            let mut next = batch();
            next.services[0].name = format!("API round {round}");
            next.open_incidents[0].title = format!("title {round}");
            reconcile(&mut store, next, ReconcileOptions::default(), ts(5));

            assert!(!store.service("S1").unwrap().active);
            assert!(store.incident("P1").unwrap().pinned);
            assert!(store.draft("P2").is_some());
            assert_eq!(store.incident("P1").unwrap().title, format!("title {round}"));
        }
    }

    #[test]
    fn test_vanished_incidents_kept_when_incomplete() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));

        let mut partial = batch();
        partial.open_incidents.truncate(1);
        partial.complete = false;
        let options = ReconcileOptions {
            infer_resolution: true,
        };
        let report = reconcile(&mut store, partial, options, ts(5));
        assert!(report.inferred_resolved.is_empty());
        assert!(store.is_open("P2"));
    }

    #[test]
    fn test_vanished_incidents_kept_without_inference() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));

        let mut next = batch();
        next.open_incidents.truncate(1);
        reconcile(&mut store, next, ReconcileOptions::default(), ts(5));
        assert!(store.is_open("P2"));
    }

    #[test]
    fn test_vanished_incidents_inferred_when_complete() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));

        let mut next = batch();
        next.open_incidents.truncate(1);
        let options = ReconcileOptions {
            infer_resolution: true,
        };
        let report = reconcile(&mut store, next, options, ts(5));
        assert_eq!(report.inferred_resolved, vec!["P2".to_string()]);
        assert_eq!(report.moved, 1);
        assert!(!store.is_open("P2"));
        assert_eq!(store.incident("P2").unwrap().updated_at, ts(5));
    }

    #[test]
    fn test_resolution_moves_between_partitions() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));

        let mut next = batch();
        let resolved = next.open_incidents.remove(0).with_status(IncidentStatus::Resolved);
        next.resolved_incidents.push(resolved);
        let report = reconcile(&mut store, next, ReconcileOptions::default(), ts(5));
        assert_eq!(report.moved, 1);
        assert!(!store.is_open("P1"));
        assert!(
            report
                .changed
                .contains(&EntityRef::new(EntityKind::Incident, "P1"))
        );
    }

    #[test]
    fn test_retrigger_is_reported() {
        let mut store = EntityStore::default();
        reconcile(&mut store, batch(), ReconcileOptions::default(), ts(4));

        let mut next = batch();
        next.open_incidents[1].status = IncidentStatus::Triggered;
        let report = reconcile(&mut store, next, ReconcileOptions::default(), ts(5));
        assert_eq!(report.newly_triggered, vec!["P2".to_string()]);
    }

    #[test]
    fn test_duplicate_listing_prefers_newest() {
        let open = incident("P1", IncidentStatus::Acknowledged, 1).with_updated_at(ts(2));
        let resolved = incident("P1", IncidentStatus::Resolved, 1).with_updated_at(ts(3));
        let merged = newest_per_id(vec![open.clone()], vec![resolved]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, IncidentStatus::Resolved);

        let tie = incident("P1", IncidentStatus::Resolved, 1).with_updated_at(ts(2));
        let merged = newest_per_id(vec![open], vec![tie]);
        assert_eq!(merged[0].status, IncidentStatus::Resolved);
    }
}
