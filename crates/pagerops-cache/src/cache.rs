//! The shared, synchronized cache.
//!
//! [`SyncCache`] owns the [`EntityStore`] behind one mutex. Every mutation
//! runs inside a single critical section that ends with a commit: derived
//! fields are recomputed once, the revision is bumped, and an immutable
//! [`CacheSnapshot`] is built. Snapshots are delivered to subscribers after
//! the store lock is released, strictly in revision order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

use pagerops_core::{
    DraftFields, DraftNote, EntityKind, EntityRef, Incident, IncidentId, IncidentStatus, Note,
    PagerOpsError, Result, Service, StatusCounts, SyncConfig, Template, TemplateId, User,
};

use crate::aggregate;
use crate::persist::LocalOverrides;
use crate::reconcile::{self, ReconcileOptions, ReconcileReport, RemoteBatch};
use crate::store::{Entity, EntityStore};

/// Author recorded on notes committed before the current user is known.
pub const LOCAL_AUTHOR: &str = "You";

/// Immutable view of the cache after one commit.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub revision: u64,
    pub taken_at: DateTime<Utc>,
    pub services: Vec<Service>,
    /// Pinned first, then newest first.
    pub open: Vec<Incident>,
    /// Newest first.
    pub resolved: Vec<Incident>,
    pub counts: StatusCounts,
    pub current_user: Option<User>,
    /// Incidents that currently have a draft note.
    pub draft_ids: BTreeSet<IncidentId>,
    pub templates: Vec<Template>,
    /// References written by the commit that produced this snapshot.
    pub changed: Vec<EntityRef>,
}

impl CacheSnapshot {
    fn empty() -> Self {
        Self {
            revision: 0,
            taken_at: Utc::now(),
            services: Vec::new(),
            open: Vec::new(),
            resolved: Vec::new(),
            counts: StatusCounts::default(),
            current_user: None,
            draft_ids: BTreeSet::new(),
            templates: Vec::new(),
            changed: Vec::new(),
        }
    }

    fn capture(store: &EntityStore, revision: u64, changed: Vec<EntityRef>) -> Self {
        let services = store.services();
        let open = store.list_open();
        let resolved = store.list_resolved();
        let counts = aggregate::compute_status_counts(&services, &open, &resolved);
        Self {
            revision,
            taken_at: Utc::now(),
            services,
            open,
            resolved,
            counts,
            current_user: store.current_user().cloned(),
            draft_ids: store.draft_ids(),
            templates: store.templates(),
            changed,
        }
    }

    /// Look up an incident in either partition.
    pub fn incident(&self, id: &str) -> Option<&Incident> {
        self.open
            .iter()
            .chain(self.resolved.iter())
            .find(|i| i.id == id)
    }
}

/// Cache-level tuning taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub infer_resolution: bool,
    pub pending_ttl: chrono::Duration,
    pub resolved_retention: chrono::Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for CacheOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            infer_resolution: config.infer_resolution,
            pending_ttl: config.pending_ttl(),
            resolved_retention: config.resolved_retention(),
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&Arc<CacheSnapshot>) + Send + Sync>;

/// Handle returned by [`SyncCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct CacheState {
    store: EntityStore,
    revision: u64,
    current: Arc<CacheSnapshot>,
}

impl CacheState {
    /// Close the critical section. Returns a snapshot if anything changed.
    fn commit(&mut self) -> Option<Arc<CacheSnapshot>> {
        if !self.store.has_changes() {
            return None;
        }
        self.store.recompute_derived();
        let changed = self.store.take_changes();
        self.revision += 1;
        let snapshot = Arc::new(CacheSnapshot::capture(&self.store, self.revision, changed));
        self.current = Arc::clone(&snapshot);
        trace!(revision = self.revision, changed = snapshot.changed.len(), "committed");
        Some(snapshot)
    }
}

#[derive(Default)]
struct Delivery {
    last_delivered: u64,
    queue: BTreeMap<u64, Arc<CacheSnapshot>>,
    delivering: bool,
}

/// Synchronized entity store with push-based snapshot delivery.
pub struct SyncCache {
    state: Mutex<CacheState>,
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
    delivery: Mutex<Delivery>,
    watch_tx: watch::Sender<Arc<CacheSnapshot>>,
    options: CacheOptions,
}

impl Default for SyncCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl SyncCache {
    pub fn new(options: CacheOptions) -> Self {
        let empty = Arc::new(CacheSnapshot::empty());
        let (watch_tx, _) = watch::channel(Arc::clone(&empty));
        Self {
            state: Mutex::new(CacheState {
                store: EntityStore::new(options.pending_ttl),
                revision: 0,
                current: empty,
            }),
            subscribers: Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            delivery: Mutex::new(Delivery::default()),
            watch_tx,
            options,
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    // =========================================================================
    // Snapshots and subscriptions
    // =========================================================================

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.lock_state().current)
    }

    pub fn revision(&self) -> u64 {
        self.lock_state().revision
    }

    /// Register a callback invoked after every commit.
    ///
    /// Callbacks run on the committing thread after the store lock is
    /// released. A callback may mutate the cache; the resulting snapshot is
    /// delivered once the current delivery round finishes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<CacheSnapshot>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().insert(id, Arc::new(callback));
        debug!(subscription = id.0, "subscriber added");
        id
    }

    /// Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock_subscribers().remove(&id).is_some()
    }

    /// Receiver that always holds the latest delivered snapshot.
    pub fn watch(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.watch_tx.subscribe()
    }

    // =========================================================================
    // Remote path
    // =========================================================================

    /// Merge a fetched batch as one commit.
    pub fn apply_remote_batch(&self, batch: RemoteBatch) -> ReconcileReport {
        let options = ReconcileOptions {
            infer_resolution: self.options.infer_resolution,
        };
        self.apply(|store| reconcile::reconcile(store, batch, options, Utc::now()))
    }

    /// Merge a polled batch and drop expired resolved incidents in the
    /// same commit, so one poll produces one snapshot.
    pub fn apply_poll(
        &self,
        batch: RemoteBatch,
        now: DateTime<Utc>,
    ) -> (ReconcileReport, Vec<IncidentId>) {
        let options = ReconcileOptions {
            infer_resolution: self.options.infer_resolution,
        };
        let cutoff = now - self.options.resolved_retention;
        self.apply(|store| {
            let report = reconcile::reconcile(store, batch, options, now);
            let pruned = store.prune_resolved(cutoff);
            (report, pruned)
        })
    }

    /// Drop resolved incidents older than the retention window.
    pub fn prune_resolved(&self, now: DateTime<Utc>) -> Vec<IncidentId> {
        let cutoff = now - self.options.resolved_retention;
        self.apply(|store| store.prune_resolved(cutoff))
    }

    // =========================================================================
    // Generic store access
    // =========================================================================

    pub fn upsert(&self, entity: Entity) -> crate::store::WriteOutcome {
        self.apply(|store| store.upsert(entity))
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.read(|store| store.get(kind, id))
    }

    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<Entity> {
        self.apply(|store| store.delete(kind, id))
    }

    /// Run a read-only closure against the store.
    pub fn read<T>(&self, f: impl FnOnce(&EntityStore) -> T) -> T {
        f(&self.lock_state().store)
    }

    pub fn incident(&self, id: &str) -> Option<Incident> {
        self.read(|store| store.incident(id).cloned())
    }

    pub fn service(&self, id: &str) -> Option<Service> {
        self.read(|store| store.service(id).cloned())
    }

    pub fn current_user(&self) -> Option<User> {
        self.read(|store| store.current_user().cloned())
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    pub fn seed_overrides(&self, overrides: LocalOverrides) {
        self.apply(|store| store.seed_overrides(overrides));
    }

    pub fn set_service_active(&self, id: &str, active: bool) -> Result<bool> {
        self.apply(|store| store.set_service_active(id, active))
    }

    pub fn set_incident_pinned(&self, id: &str, pinned: bool) -> Result<bool> {
        self.apply(|store| store.set_incident_pinned(id, pinned))
    }

    pub fn append_note(&self, id: &str, note: Note) -> Result<()> {
        self.apply(|store| store.append_note(id, note))
    }

    pub fn set_pending_status(&self, id: &str, status: IncidentStatus) -> Result<()> {
        self.apply(|store| store.set_pending_status(id, status))
    }

    pub fn clear_pending(&self, id: &str, revert: bool) -> Result<()> {
        self.apply(|store| store.clear_pending(id, revert))
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    pub fn draft(&self, incident_id: &str) -> Option<DraftNote> {
        self.read(|store| store.draft(incident_id).cloned())
    }

    /// Merge `fields` into the draft, creating it when missing.
    pub fn put_draft(&self, incident_id: &str, fields: DraftFields) -> DraftNote {
        self.apply(|store| {
            let mut draft = store
                .draft(incident_id)
                .cloned()
                .unwrap_or_else(|| DraftNote::empty(incident_id));
            draft.apply(fields);
            draft.last_updated = Utc::now();
            store.upsert(Entity::DraftNote(draft.clone()));
            draft
        })
    }

    pub fn remove_draft(&self, incident_id: &str) -> Option<DraftNote> {
        self.apply(|store| match store.delete(EntityKind::DraftNote, incident_id) {
            Ok(Entity::DraftNote(draft)) => Some(draft),
            _ => None,
        })
    }

    /// Restore drafts read from persistence. Returns how many were loaded.
    pub fn load_drafts(&self, drafts: Vec<DraftNote>) -> usize {
        self.apply(|store| {
            let count = drafts.len();
            for draft in drafts {
                store.upsert(Entity::DraftNote(draft));
            }
            count
        })
    }

    /// Turn the draft into a note on its incident and drop the draft.
    ///
    /// The draft is kept when the incident is unknown or the composed note
    /// would be empty.
    pub fn commit_draft(&self, incident_id: &str) -> Result<Note> {
        self.apply(|store| {
            let draft = store
                .draft(incident_id)
                .cloned()
                .ok_or_else(|| PagerOpsError::no_draft(incident_id))?;
            if store.incident(incident_id).is_none() {
                return Err(PagerOpsError::not_found(EntityKind::Incident, incident_id));
            }
            let content = draft.compose();
            if content.is_empty() {
                return Err(PagerOpsError::validation("draft", "note content is empty"));
            }
            let author = store
                .current_user()
                .map(|u| u.name.clone())
                .unwrap_or_else(|| LOCAL_AUTHOR.to_string());
            let note = Note {
                author,
                content,
                timestamp: Utc::now(),
            };
            store.append_note(incident_id, note.clone())?;
            store.delete(EntityKind::DraftNote, incident_id)?;
            Ok(note)
        })
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn templates(&self) -> Vec<Template> {
        self.read(|store| store.templates())
    }

    pub fn load_templates(&self, templates: Vec<Template>) {
        self.apply(|store| {
            for template in templates {
                store.upsert(Entity::Template(template));
            }
        });
    }

    pub fn put_template(&self, template: Template) {
        self.apply(|store| store.upsert(Entity::Template(template)));
    }

    pub fn remove_template(&self, id: TemplateId) -> Result<Template> {
        self.apply(|store| match store.delete(EntityKind::Template, &id.to_string())? {
            Entity::Template(template) => Ok(template),
            other => Err(PagerOpsError::internal(format!(
                "template table returned {}",
                other.kind()
            ))),
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run `f` in one critical section, commit, then deliver outside the lock.
    fn apply<T>(&self, f: impl FnOnce(&mut EntityStore) -> T) -> T {
        let (value, snapshot) = {
            let mut state = self.lock_state();
            let value = f(&mut state.store);
            (value, state.commit())
        };
        if let Some(snapshot) = snapshot {
            self.deliver(snapshot);
        }
        value
    }

    fn deliver(&self, snapshot: Arc<CacheSnapshot>) {
        {
            let mut delivery = self.lock_delivery();
            delivery.queue.insert(snapshot.revision, snapshot);
            if delivery.delivering {
                return;
            }
            delivery.delivering = true;
        }
        let _guard = DeliveryGuard(self);

        loop {
            let next = {
                let mut delivery = self.lock_delivery();
                let Some((revision, snapshot)) = delivery.queue.pop_first() else {
                    delivery.delivering = false;
                    return;
                };
                if revision <= delivery.last_delivered {
                    continue;
                }
                delivery.last_delivered = revision;
                snapshot
            };

            self.watch_tx.send_replace(Arc::clone(&next));
            let subscribers: Vec<Subscriber> = self.lock_subscribers().values().cloned().collect();
            for callback in subscribers {
                callback(&next);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the delivery slot if a subscriber panics mid-round.
struct DeliveryGuard<'a>(&'a SyncCache);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock_delivery().delivering = false;
        }
    }
}
