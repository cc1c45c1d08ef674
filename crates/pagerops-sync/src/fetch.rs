//! One remote polling cycle.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use pagerops_cache::RemoteBatch;
use pagerops_core::{Result, User};
use pagerops_remote::{IncidentProvider, ListFilter};

/// What a cycle should ask for.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    /// The key owner, when already known for this provider.
    pub current_user: Option<User>,
    pub assigned_only: bool,
    pub resolved_since: DateTime<Utc>,
}

/// Read everything one merge needs.
///
/// The current user is fetched first when unknown; the four listings then
/// run concurrently. The first failure fails the whole cycle.
pub async fn fetch_batch(provider: &dyn IncidentProvider, plan: FetchPlan) -> Result<RemoteBatch> {
    let user = match plan.current_user {
        Some(user) => user,
        None => provider.current_user().await?,
    };
    let filter = if plan.assigned_only {
        ListFilter::assigned_to(user.id.clone())
    } else {
        ListFilter::default()
    };

    let (services, users, open, resolved) = tokio::try_join!(
        provider.list_services(),
        provider.list_users(),
        provider.list_open_incidents(&filter),
        provider.list_resolved_incidents(plan.resolved_since, &filter),
    )?;

    let complete = services.complete && users.complete && open.complete && resolved.complete;
    if !complete {
        warn!(
            provider = provider.name(),
            "listing truncated; vanished incidents will not be inferred resolved"
        );
    }
    debug!(
        services = services.items.len(),
        users = users.items.len(),
        open = open.items.len(),
        resolved = resolved.items.len(),
        complete,
        "fetched remote batch"
    );

    Ok(RemoteBatch {
        services: services.items,
        open_incidents: open.items,
        resolved_incidents: resolved.items,
        users: users.items,
        current_user: Some(user),
        complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagerops_core::{Incident, IncidentStatus, Service};
    use pagerops_remote::{MockFailure, MockProvider};

    fn plan(current_user: Option<User>, assigned_only: bool) -> FetchPlan {
        FetchPlan {
            current_user,
            assigned_only,
            resolved_since: Utc::now() - chrono::Duration::hours(24),
        }
    }

    fn provider() -> MockProvider {
        let mut mine = Incident::new("P1", "cpu", "API");
        mine.assigned_user_ids = vec!["U1".into()];
        MockProvider::new()
            .with_user(User::new("U1", "dana@example.com", "Dana"))
            .with_services(vec![Service::new("S1", "API")])
            .with_incidents(vec![
                mine,
                Incident::new("P2", "disk", "API"),
                Incident::new("P3", "old", "API").with_status(IncidentStatus::Resolved),
            ])
    }

    #[tokio::test]
    async fn test_fetch_builds_complete_batch() {
        let mock = provider();
        let batch = fetch_batch(&mock, plan(None, false)).await.unwrap();
        assert!(batch.complete);
        assert_eq!(batch.open_incidents.len(), 2);
        assert_eq!(batch.resolved_incidents.len(), 1);
        assert_eq!(batch.current_user.unwrap().id, "U1");
        assert_eq!(mock.calls("current_user"), 1);
    }

    #[tokio::test]
    async fn test_known_user_is_not_refetched_and_filters() {
        let mock = provider();
        let user = User::new("U1", "dana@example.com", "Dana");
        let batch = fetch_batch(&mock, plan(Some(user), true)).await.unwrap();
        assert_eq!(mock.calls("current_user"), 0);
        assert_eq!(batch.open_incidents.len(), 1);
        assert_eq!(batch.open_incidents[0].id, "P1");
    }

    #[tokio::test]
    async fn test_truncated_listing_marks_batch_incomplete() {
        let mock = provider();
        mock.set_truncated(true);
        let batch = fetch_batch(&mock, plan(None, false)).await.unwrap();
        assert!(!batch.complete);
    }

    #[tokio::test]
    async fn test_any_failure_fails_the_cycle() {
        let mock = provider();
        mock.fail_next(1, MockFailure::RateLimited(Some(30)));
        let err = fetch_batch(&mock, plan(None, false)).await.unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(30));
    }
}
