//! Integration tests for the PagerDuty client against a local mock server.
//!
//! These tests verify that the client:
//! 1. Sends the token and version headers
//! 2. Follows offset pagination and reports truncation
//! 3. Maps HTTP failures onto the error taxonomy
//! 4. Sends write requests with the acting user's email
//! 5. Lists alerts and sends snooze, escalate and merge requests

use std::time::Duration;

use chrono::{TimeZone, Utc};
use pagerops_core::{IncidentStatus, PagerOpsError, RemoteConfig};
use pagerops_remote::{IncidentProvider, ListFilter, PagerDutyClient};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

fn client(server: &MockServer, page_limit: u32, max_pages: u32) -> PagerDutyClient {
    let remote = RemoteConfig {
        api_base_url: server.uri(),
        page_limit,
        max_pages,
    };
    PagerDutyClient::new("u+secret", &remote, Duration::from_secs(2)).unwrap()
}

fn incident_json(id: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "incident_number": 7,
        "title": format!("incident {id}"),
        "status": status,
        "urgency": "high",
        "created_at": "2026-03-01T08:00:00Z",
        "last_status_change_at": "2026-03-01T08:10:00Z",
        "service": {"id": "PSVC1", "summary": "API"},
        "assignments": []
    })
}

#[tokio::test]
async fn test_current_user_sends_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .and(header("Authorization", "Token token=u+secret"))
        .and(header("Accept", "application/vnd.pagerduty+json;version=2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "user": {"id": "PUSR1", "name": "Dana", "email": "dana@example.com"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let user = client(&server, 100, 10).current_user().await.unwrap();
    assert_eq!(user.id, "PUSR1");
    assert_eq!(user.email, "dana@example.com");
}

#[tokio::test]
async fn test_services_follow_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "services": [{"id": "PSVC1", "name": "Checkout API"}],
            "more": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "services": [{"id": "PSVC2", "name": "Web"}],
            "more": false
        })))
        .mount(&server)
        .await;

    let page = client(&server, 1, 10).list_services().await.unwrap();
    assert!(page.complete);
    let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["Checkout API", "Web"]);
    assert_eq!(page.items[0].abbreviation, "CA");
}

#[tokio::test]
async fn test_page_cap_reports_partial_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "users": [{"id": "PUSR1", "name": "Dana", "email": "dana@example.com"}],
            "more": true
        })))
        .expect(2)
        .mount(&server)
        .await;

    let page = client(&server, 1, 2).list_users().await.unwrap();
    assert!(!page.complete);
    assert_eq!(page.items.len(), 2);
}

#[tokio::test]
async fn test_open_incidents_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/incidents"))
        .and(query_param("statuses[]", "triggered"))
        .and(query_param("statuses[]", "acknowledged"))
        .and(query_param("user_ids[]", "PUSR1"))
        .and(query_param("sort_by", "created_at:desc"))
        .and(query_param("date_range", "all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "incidents": [incident_json("PINC1", "triggered"), incident_json("PINC2", "acknowledged")],
            "more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server, 100, 10)
        .list_open_incidents(&ListFilter::assigned_to("PUSR1"))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[1].status, IncidentStatus::Acknowledged);
    assert_eq!(page.items[0].service, "API");
}

#[tokio::test]
async fn test_resolved_incidents_since() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/incidents"))
        .and(query_param("statuses[]", "resolved"))
        .and(query_param("since", "2026-03-01T00:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "incidents": [incident_json("PINC3", "resolved")],
            "more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let page = client(&server, 100, 10)
        .list_resolved_incidents(since, &ListFilter::default())
        .await
        .unwrap();
    assert_eq!(page.items[0].status, IncidentStatus::Resolved);
}

#[tokio::test]
async fn test_acknowledge_sends_reference_with_from() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/incidents"))
        .and(header("From", "dana@example.com"))
        .and(body_json(serde_json::json!({
            "incidents": [{"id": "PINC1", "type": "incident_reference", "status": "acknowledged"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"incidents": []})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server, 100, 10)
        .acknowledge("PINC1", "dana@example.com")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_add_note_returns_created_note() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/incidents/PINC1/notes"))
        .and(header("From", "dana@example.com"))
        .and(body_json(serde_json::json!({"note": {"content": "Rolled back"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "note": {
                "id": "PNOTE1",
                "user": {"id": "PUSR1", "summary": "Dana"},
                "content": "Rolled back",
                "created_at": "2026-03-01T09:00:00Z"
            }
        })))
        .mount(&server)
        .await;

    let note = client(&server, 100, 10)
        .add_note("PINC1", "dana@example.com", "Rolled back")
        .await
        .unwrap();
    assert_eq!(note.author, "Dana");
    assert_eq!(note.content, "Rolled back");
}

#[tokio::test]
async fn test_incident_alerts_are_listed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/incidents/PINC1/alerts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "alerts": [{
                "id": "PALR1",
                "summary": "CPU > 90% on web-1",
                "status": "triggered",
                "created_at": "2026-03-01T08:00:00Z",
                "body": {"details": {"host": "web-1"}}
            }],
            "more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let alerts = client(&server, 100, 10)
        .list_incident_alerts("PINC1")
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "PALR1");
    assert_eq!(alerts[0].status, "triggered");
    assert_eq!(
        alerts[0].created_at,
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_snooze_posts_duration_in_seconds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/incidents/PINC1/snooze"))
        .and(header("From", "dana@example.com"))
        .and(body_json(serde_json::json!({"duration": 1800})))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "incident": incident_json("PINC1", "acknowledged")
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server, 100, 10)
        .snooze("PINC1", "dana@example.com", Duration::from_secs(30 * 60))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_escalate_sends_escalation_level() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/incidents"))
        .and(header("From", "dana@example.com"))
        .and(body_json(serde_json::json!({
            "incidents": [{"id": "PINC1", "type": "incident_reference", "escalation_level": 2}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "incidents": [incident_json("PINC1", "triggered")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server, 100, 10)
        .escalate("PINC1", "dana@example.com", 2)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_merge_puts_source_references() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/incidents/PINC1/merge"))
        .and(header("From", "dana@example.com"))
        .and(body_json(serde_json::json!({
            "source_incidents": [
                {"id": "PINC2", "type": "incident_reference"},
                {"id": "PINC3", "type": "incident_reference"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "incident": incident_json("PINC1", "triggered")
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sources = vec!["PINC2".to_string(), "PINC3".to_string()];
    client(&server, 100, 10)
        .merge_incidents("PINC1", &sources, "dana@example.com")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_snooze_of_resolved_incident_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/incidents/PINC1/snooze"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Incident Already Resolved"))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10)
        .snooze("PINC1", "dana@example.com", Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PagerOpsError::RemoteProtocol { status: 400, ref message } if message.contains("Already Resolved"))
    );
}

#[tokio::test]
async fn test_unauthorized_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10).current_user().await.unwrap_err();
    assert!(err.is_auth_error());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_429_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10).list_services().await.unwrap_err();
    assert!(matches!(err, PagerOpsError::RateLimited { retry_after_secs: Some(7) }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10).list_users().await.unwrap_err();
    assert!(matches!(err, PagerOpsError::TransientNetwork { .. }));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10).current_user().await.unwrap_err();
    assert!(matches!(err, PagerOpsError::Timeout { timeout_secs: 2 }));
}

#[tokio::test]
async fn test_malformed_body_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = client(&server, 100, 10).list_services().await.unwrap_err();
    assert!(matches!(err, PagerOpsError::RemoteProtocol { .. }));
}
