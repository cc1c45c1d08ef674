//! Integration tests for pagerops-cache: reconciliation, aggregation and
//! drafts working together through the public API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pagerops_cache::{
    CacheOptions, DraftManager, DraftStore, MemoryStore, RemoteBatch, SyncCache,
    compute_status_counts,
};
use pagerops_core::{
    DraftFields, Incident, IncidentStatus, Service, StatusCounts, User,
};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
}

fn incident(id: &str, service: &str, status: IncidentStatus) -> Incident {
    Incident::new(id, format!("incident {id}"), service)
        .with_status(status)
        .with_created_at(at(8))
}

/// The batch a healthy poll of a small account returns.
fn poll() -> RemoteBatch {
    RemoteBatch {
        services: vec![Service::new("PSVC1", "API"), Service::new("PSVC2", "Web")],
        open_incidents: vec![
            incident("1", "API", IncidentStatus::Triggered),
            incident("2", "API", IncidentStatus::Acknowledged),
            incident("4", "Web", IncidentStatus::Triggered),
        ],
        resolved_incidents: vec![incident("3", "API", IncidentStatus::Resolved)],
        users: vec![User::new("PUSR1", "dana@example.com", "Dana")],
        current_user: Some(User::new("PUSR1", "dana@example.com", "Dana")),
        complete: true,
    }
}

#[test]
fn test_counts_follow_active_services() {
    let cache = SyncCache::default();
    cache.apply_remote_batch(poll());
    assert_eq!(
        cache.snapshot().counts,
        StatusCounts {
            triggered: 2,
            acknowledged: 1,
            resolved: 1
        }
    );

    cache.set_service_active("PSVC1", false).unwrap();
    let snapshot = cache.snapshot();
    assert_eq!(
        snapshot.counts,
        StatusCounts {
            triggered: 1,
            acknowledged: 0,
            resolved: 0
        }
    );
    // Nothing was deleted.
    assert_eq!(snapshot.open.len(), 3);
    assert_eq!(snapshot.resolved.len(), 1);

    // The snapshot counts agree with the pure function over the same tables.
    assert_eq!(
        compute_status_counts(&snapshot.services, &snapshot.open, &snapshot.resolved),
        snapshot.counts
    );
}

#[test]
fn test_local_state_survives_repeated_polls() {
    let cache = SyncCache::default();
    cache.apply_remote_batch(poll());
    cache.set_service_active("PSVC2", false).unwrap();
    cache.set_incident_pinned("2", true).unwrap();
    cache.put_draft("1", DraftFields::default().impact("checkout slow"));

    for _ in 0..5 {
        cache.apply_remote_batch(poll());
    }

    let snapshot = cache.snapshot();
    assert!(!cache.service("PSVC2").unwrap().active);
    assert_eq!(snapshot.open[0].id, "2", "pinned incident sorts first");
    assert!(snapshot.open[0].pinned);
    assert_eq!(cache.draft("1").unwrap().impact, "checkout slow");
}

#[test]
fn test_subscribers_only_see_whole_batches() {
    let cache = SyncCache::default();
    let seen: Arc<Mutex<Vec<StatusCounts>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cache.subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.counts));

    cache.apply_remote_batch(poll());
    let mut next = poll();
    for incident in &mut next.open_incidents {
        incident.status = IncidentStatus::Acknowledged;
    }
    cache.apply_remote_batch(next);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].triggered, 0);
    assert_eq!(seen[1].acknowledged, 3);
}

#[test]
fn test_optimistic_acknowledge_against_stale_polls() {
    let cache = SyncCache::default();
    cache.apply_remote_batch(poll());
    cache.set_pending_status("1", IncidentStatus::Acknowledged).unwrap();

    // The provider has not caught up yet.
    cache.apply_remote_batch(poll());
    assert_eq!(cache.incident("1").unwrap().status, IncidentStatus::Acknowledged);

    // Provider resolved it in the meantime: resolution supersedes the ack.
    let mut next = poll();
    let resolved = next.open_incidents.remove(0).with_status(IncidentStatus::Resolved);
    next.resolved_incidents.push(resolved);
    cache.apply_remote_batch(next);
    let snapshot = cache.snapshot();
    assert!(snapshot.resolved.iter().any(|i| i.id == "1"));
    assert!(cache.read(|store| store.pending("1").is_none()));
}

#[test]
fn test_inferred_resolution_is_opt_in() {
    let mut next = poll();
    next.open_incidents.retain(|i| i.id != "4");

    let cautious = SyncCache::default();
    cautious.apply_remote_batch(poll());
    cautious.apply_remote_batch(next.clone());
    assert!(cautious.snapshot().open.iter().any(|i| i.id == "4"));

    let inferring = SyncCache::new(CacheOptions {
        infer_resolution: true,
        ..CacheOptions::default()
    });
    inferring.apply_remote_batch(poll());
    let report = inferring.apply_remote_batch(next);
    assert_eq!(report.inferred_resolved, vec!["4".to_string()]);
    assert!(inferring.snapshot().resolved.iter().any(|i| i.id == "4"));
}

#[tokio::test(start_paused = true)]
async fn test_draft_round_trip_through_persistence() {
    let cache = Arc::new(SyncCache::default());
    cache.apply_remote_batch(poll());
    let store = Arc::new(MemoryStore::new());
    let drafts = DraftManager::spawn(
        Arc::clone(&cache),
        Arc::clone(&store) as Arc<dyn DraftStore>,
        Duration::from_millis(500),
    );

    drafts.set_draft("1", DraftFields::default().note_text("Rolled back"));
    drafts.set_draft("1", DraftFields::default().links("https://deploys/42"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    drafts.shutdown().await;

    // A fresh process restores the draft with both edits.
    let restarted = Arc::new(SyncCache::default());
    restarted.apply_remote_batch(poll());
    let drafts = DraftManager::spawn(
        Arc::clone(&restarted),
        Arc::clone(&store) as Arc<dyn DraftStore>,
        Duration::from_millis(500),
    );
    assert_eq!(drafts.load_persisted().unwrap(), 1);
    let note = drafts.commit_draft("1").unwrap();
    assert_eq!(note.content, "Rolled back\n\nLinks: https://deploys/42");
    assert!(drafts.get_draft("1").is_none());
    drafts.shutdown().await;
    assert!(store.stored_draft("1").is_none());
}
