//! Derived aggregates.
//!
//! Everything here is a pure function of the entity tables. Nothing is
//! stored authoritatively; the cache recomputes on every commit.

use std::collections::{HashMap, HashSet};

use pagerops_core::{Incident, IncidentStatus, Service, StatusCounts};

/// Names of services that count toward aggregates.
pub fn active_service_names(services: &[Service]) -> HashSet<&str> {
    services
        .iter()
        .filter(|s| s.active)
        .map(|s| s.name.as_str())
        .collect()
}

/// Per-status counts restricted to active services.
///
/// `triggered` and `acknowledged` come only from `open`; `resolved` comes
/// only from `resolved`. Deterministic for identical inputs.
pub fn compute_status_counts(
    services: &[Service],
    open: &[Incident],
    resolved: &[Incident],
) -> StatusCounts {
    let active = active_service_names(services);
    let mut counts = StatusCounts::default();

    for incident in open.iter().filter(|i| active.contains(i.service.as_str())) {
        match incident.status {
            IncidentStatus::Triggered => counts.triggered += 1,
            IncidentStatus::Acknowledged => counts.acknowledged += 1,
            IncidentStatus::Resolved => {}
        }
    }
    counts.resolved = resolved
        .iter()
        .filter(|i| active.contains(i.service.as_str()))
        .count() as u32;

    counts
}

/// Open incidents per service name.
pub fn open_counts_by_service<'a>(
    open: impl IntoIterator<Item = &'a Incident>,
) -> HashMap<&'a str, u32> {
    let mut counts = HashMap::new();
    for incident in open {
        *counts.entry(incident.service.as_str()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(id: &str, service: &str, status: IncidentStatus) -> Incident {
        Incident::new(id, "t", service).with_status(status)
    }

    #[test]
    fn test_counts_scenario() {
        let mut services = vec![Service::new("S1", "API")];
        let open = vec![
            incident("1", "API", IncidentStatus::Triggered),
            incident("2", "API", IncidentStatus::Acknowledged),
        ];
        let resolved = vec![incident("3", "API", IncidentStatus::Resolved)];

        let counts = compute_status_counts(&services, &open, &resolved);
        assert_eq!(
            counts,
            StatusCounts {
                triggered: 1,
                acknowledged: 1,
                resolved: 1
            }
        );

        services[0].active = false;
        assert_eq!(
            compute_status_counts(&services, &open, &resolved),
            StatusCounts::default()
        );
        assert_eq!(open.len() + resolved.len(), 3);
    }

    #[test]
    fn test_counts_ignore_unknown_services() {
        let services = vec![Service::new("S1", "API"), Service::new("S2", "Web").with_active(false)];
        let open = vec![
            incident("1", "API", IncidentStatus::Triggered),
            incident("2", "Web", IncidentStatus::Triggered),
            incident("3", "Batch", IncidentStatus::Triggered),
        ];
        let counts = compute_status_counts(&services, &open, &[]);
        assert_eq!(counts.triggered, 1);
    }

    #[test]
    fn test_counts_are_pure() {
        let services = vec![Service::new("S1", "API")];
        let open = vec![incident("1", "API", IncidentStatus::Acknowledged)];
        let resolved = vec![incident("2", "API", IncidentStatus::Resolved)];
        let first = compute_status_counts(&services, &open, &resolved);
        for _ in 0..10 {
            assert_eq!(compute_status_counts(&services, &open, &resolved), first);
        }
    }

    #[test]
    fn test_resolved_count_uses_resolved_list_only() {
        let services = vec![Service::new("S1", "API")];
        // A resolved-status record in the open list is not counted.
        let open = vec![incident("1", "API", IncidentStatus::Resolved)];
        let counts = compute_status_counts(&services, &open, &[]);
        assert_eq!(counts, StatusCounts::default());
    }
}
