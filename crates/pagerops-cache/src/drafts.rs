//! Draft note lifecycle and debounced persistence.
//!
//! Edits land in the cache immediately. Durable writes are deferred per
//! incident until edits have been quiet for the debounce period, and always
//! write whatever the cache holds at that moment, so the durable copy may
//! lag behind memory but never goes backwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use pagerops_core::{DraftFields, DraftNote, IncidentId, Note, PagerOpsError, Result};

use crate::cache::SyncCache;
use crate::persist::DraftStore;

#[derive(Debug)]
enum DraftCommand {
    /// The in-memory draft changed; (re)start its quiet period.
    Touched(IncidentId),
    /// The draft is gone; cancel any pending write and delete the copy.
    Discarded(IncidentId),
    /// Write every pending draft now.
    Flush(oneshot::Sender<()>),
    /// Flush and stop.
    Shutdown(oneshot::Sender<()>),
}

/// Owns draft create/update/discard/commit and their persistence.
pub struct DraftManager {
    cache: Arc<SyncCache>,
    store: Arc<dyn DraftStore>,
    tx: mpsc::UnboundedSender<DraftCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DraftManager {
    /// Start the persistence task. Must be called inside a tokio runtime.
    pub fn spawn(cache: Arc<SyncCache>, store: Arc<dyn DraftStore>, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_persistence(
            Arc::clone(&cache),
            Arc::clone(&store),
            debounce,
            rx,
        ));
        Self {
            cache,
            store,
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Restore every durable draft into the cache.
    pub fn load_persisted(&self) -> Result<usize> {
        let drafts = self.store.load_drafts()?;
        let count = self.cache.load_drafts(drafts);
        info!(count, "restored draft notes");
        Ok(count)
    }

    pub fn get_draft(&self, incident_id: &str) -> Option<DraftNote> {
        self.cache.draft(incident_id)
    }

    /// Merge `fields` into the incident's draft, creating it if needed.
    pub fn set_draft(&self, incident_id: &str, fields: DraftFields) -> DraftNote {
        let draft = self.cache.put_draft(incident_id, fields);
        self.send(DraftCommand::Touched(incident_id.to_string()));
        draft
    }

    /// Returns whether a draft existed.
    pub fn discard_draft(&self, incident_id: &str) -> bool {
        let existed = self.cache.remove_draft(incident_id).is_some();
        self.send(DraftCommand::Discarded(incident_id.to_string()));
        existed
    }

    /// Convert the draft into a note on the incident.
    pub fn commit_draft(&self, incident_id: &str) -> Result<Note> {
        match self.cache.commit_draft(incident_id) {
            Ok(note) => {
                self.send(DraftCommand::Discarded(incident_id.to_string()));
                info!(incident_id, "committed draft note");
                Ok(note)
            }
            Err(e @ PagerOpsError::NoDraft { .. }) => {
                warn!(incident_id, "commit requested without a draft");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until every pending write has been made.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(DraftCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush pending writes and stop the persistence task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(DraftCommand::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn send(&self, command: DraftCommand) {
        if self.tx.send(command).is_err() {
            debug!("draft persistence stopped; edit kept in memory only");
        }
    }
}

async fn run_persistence(
    cache: Arc<SyncCache>,
    store: Arc<dyn DraftStore>,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<DraftCommand>,
) {
    let mut due: HashMap<IncidentId, Instant> = HashMap::new();

    loop {
        let next = due.values().min().copied();
        let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            command = rx.recv() => match command {
                Some(DraftCommand::Touched(id)) => {
                    due.insert(id, Instant::now() + debounce);
                }
                Some(DraftCommand::Discarded(id)) => {
                    due.remove(&id);
                    if let Err(e) = store.delete_draft(&id) {
                        warn!(incident_id = %id, error = %e, "failed to delete draft copy");
                    }
                }
                Some(DraftCommand::Flush(ack)) => {
                    write_all(&cache, store.as_ref(), &mut due);
                    let _ = ack.send(());
                }
                Some(DraftCommand::Shutdown(ack)) => {
                    write_all(&cache, store.as_ref(), &mut due);
                    let _ = ack.send(());
                    break;
                }
                None => {
                    write_all(&cache, store.as_ref(), &mut due);
                    break;
                }
            },
            _ = sleep_until(wake), if next.is_some() => {
                let now = Instant::now();
                let ready: Vec<IncidentId> = due
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in ready {
                    due.remove(&id);
                    write_latest(&cache, store.as_ref(), &id);
                }
            }
        }
    }
    debug!("draft persistence stopped");
}

fn write_all(cache: &SyncCache, store: &dyn DraftStore, due: &mut HashMap<IncidentId, Instant>) {
    for (id, _) in due.drain() {
        write_latest(cache, store, &id);
    }
}

fn write_latest(cache: &SyncCache, store: &dyn DraftStore, incident_id: &str) {
    // A draft that is gone by now was discarded or committed; its delete
    // arrives as its own command.
    let Some(draft) = cache.draft(incident_id) else {
        return;
    };
    match store.save_draft(&draft) {
        Ok(()) => debug!(incident_id, "persisted draft"),
        Err(e) => warn!(incident_id, error = %e, "failed to persist draft"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::reconcile::RemoteBatch;
    use pagerops_core::Incident;

    fn setup() -> (Arc<SyncCache>, Arc<MemoryStore>, DraftManager) {
        let cache = Arc::new(SyncCache::default());
        cache.apply_remote_batch(RemoteBatch {
            open_incidents: vec![Incident::new("P1", "cpu", "API")],
            ..RemoteBatch::default()
        });
        let store = Arc::new(MemoryStore::new());
        let drafts = DraftManager::spawn(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn DraftStore>,
            Duration::from_millis(500),
        );
        (cache, store, drafts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_written_once_with_latest_value() {
        let (_cache, store, drafts) = setup();
        drafts.set_draft("P1", DraftFields::default().note_text("I"));
        drafts.set_draft("P1", DraftFields::default().note_text("In"));
        drafts.set_draft("P1", DraftFields::default().note_text("Investigating"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.draft_writes(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.draft_writes(), 1);
        assert_eq!(store.stored_draft("P1").unwrap().note_text, "Investigating");
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_is_visible_before_persistence() {
        let (_cache, store, drafts) = setup();
        drafts.set_draft("P1", DraftFields::default().impact("EU down"));
        drafts.set_draft("P1", DraftFields::default().actions("failover"));

        let draft = drafts.get_draft("P1").unwrap();
        assert_eq!(draft.impact, "EU down");
        assert_eq!(draft.actions, "failover");
        assert!(store.stored_draft("P1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_cancels_pending_write() {
        let (_cache, store, drafts) = setup();
        drafts.set_draft("P1", DraftFields::default().note_text("oops"));
        assert!(drafts.discard_draft("P1"));
        assert!(!drafts.discard_draft("P1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.draft_writes(), 0);
        assert!(drafts.get_draft("P1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_deletes_durable_copy() {
        let (cache, store, drafts) = setup();
        drafts.set_draft("P1", DraftFields::default().note_text("Fixed"));
        drafts.flush().await;
        assert!(store.stored_draft("P1").is_some());

        let note = drafts.commit_draft("P1").unwrap();
        assert_eq!(note.content, "Fixed");
        drafts.flush().await;
        assert!(store.stored_draft("P1").is_none());
        assert!(drafts.get_draft("P1").is_none());
        assert_eq!(cache.incident("P1").unwrap().notes.len(), 1);

        let err = drafts.commit_draft("P1").unwrap_err();
        assert!(matches!(err, PagerOpsError::NoDraft { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes() {
        let (_cache, store, drafts) = setup();
        drafts.set_draft("P1", DraftFields::default().links("https://runbook"));
        drafts.shutdown().await;
        assert_eq!(store.stored_draft("P1").unwrap().links, "https://runbook");

        // Edits after shutdown stay in memory.
        drafts.set_draft("P1", DraftFields::default().links("later"));
        assert_eq!(drafts.get_draft("P1").unwrap().links, "later");
    }

    #[tokio::test]
    async fn test_load_persisted_restores_drafts() {
        let cache = Arc::new(SyncCache::default());
        let store = Arc::new(MemoryStore::new());
        let mut saved = DraftNote::empty("P9");
        saved.why_triggered = "disk alarm".into();
        store.save_draft(&saved).unwrap();

        let drafts = DraftManager::spawn(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn DraftStore>,
            Duration::from_millis(500),
        );
        assert_eq!(drafts.load_persisted().unwrap(), 1);
        assert_eq!(drafts.get_draft("P9").unwrap().why_triggered, "disk alarm");
        drafts.shutdown().await;
    }
}
