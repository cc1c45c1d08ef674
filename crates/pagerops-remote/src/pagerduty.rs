//! PagerDuty REST API v2 client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use pagerops_core::timestamp::format_timestamp;
use pagerops_core::{
    Alert, Incident, IncidentStatus, Note, PagerOpsError, RemoteConfig, Result, Service, User,
};

use crate::provider::{IncidentProvider, ListFilter, Page};
use crate::wire::{
    self, Merge, NewNote, NoteContent, NoteEnvelope, Snooze, StatusUpdate, UserEnvelope,
    WireAlert, WireIncident, WireService, WireUser,
};

const ACCEPT: &str = "application/vnd.pagerduty+json;version=2";

/// Talks to the PagerDuty REST API with a user or account api key.
pub struct PagerDutyClient {
    client: Client,
    api_key: String,
    base_url: String,
    page_limit: u32,
    max_pages: u32,
    timeout: Duration,
}

impl PagerDutyClient {
    /// Build a client. Fails with an auth error when `api_key` is blank.
    pub fn new(api_key: impl Into<String>, remote: &RemoteConfig, timeout: Duration) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PagerOpsError::auth("api key is required"));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PagerOpsError::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: remote.api_base_url.trim_end_matches('/').to_string(),
            page_limit: remote.page_limit.max(1),
            max_pages: remote.max_pages.max(1),
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("Token token={}", self.api_key))
            .header("Accept", ACCEPT)
    }

    /// Send a request and return the body of a successful response.
    async fn send(&self, request: RequestBuilder) -> Result<String> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "PagerDuty request failed");
            return Err(PagerOpsError::from_http_status(status.as_u16(), retry_after, &body));
        }

        response.text().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, error: reqwest::Error) -> PagerOpsError {
        if error.is_timeout() {
            PagerOpsError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else if error.is_decode() {
            PagerOpsError::RemoteProtocol {
                status: error.status().map(|s| s.as_u16()).unwrap_or(0),
                message: error.to_string(),
            }
        } else {
            PagerOpsError::network(error.to_string())
        }
    }

    /// Follow offset pagination until `more` is false or the page cap is hit.
    async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<Page<T>> {
        let mut items = Vec::new();
        let mut offset: u32 = 0;

        for page in 0..self.max_pages {
            let request = self
                .client
                .get(self.url(path))
                .query(query)
                .query(&[("limit", self.page_limit), ("offset", offset)]);
            let body = self.send(request).await?;
            let listing = wire::decode_list::<T>(&body, key)?;
            let received = listing.items.len() as u32;
            items.extend(listing.items);

            if !listing.more || received == 0 {
                debug!(path, pages = page + 1, count = items.len(), "listing complete");
                return Ok(Page::complete(items));
            }
            offset += received;
        }

        warn!(path, max_pages = self.max_pages, "listing truncated at page cap");
        Ok(Page::partial(items))
    }

    async fn list_incidents(
        &self,
        statuses: &[IncidentStatus],
        since: Option<DateTime<Utc>>,
        filter: &ListFilter,
    ) -> Result<Page<Incident>> {
        let mut query: Vec<(&str, String)> = statuses
            .iter()
            .map(|s| ("statuses[]", s.as_str().to_string()))
            .collect();
        query.extend(filter.user_ids.iter().map(|id| ("user_ids[]", id.clone())));
        query.push(("sort_by", "created_at:desc".to_string()));
        match since {
            Some(since) => query.push(("since", format_timestamp(&since))),
            // Without a range the API only covers the last 30 days.
            None => query.push(("date_range", "all".to_string())),
        }

        let page = self
            .list_all::<WireIncident>("/incidents", "incidents", &query)
            .await?;
        let items = page
            .items
            .into_iter()
            .map(Incident::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page {
            items,
            complete: page.complete,
        })
    }

    async fn update_status(&self, incident_id: &str, from: &str, status: IncidentStatus) -> Result<()> {
        let request = self
            .client
            .put(self.url("/incidents"))
            .header("From", from)
            .json(&StatusUpdate::single(incident_id, status));
        self.send(request).await?;
        info!(incident_id, status = status.as_str(), "updated incident status");
        Ok(())
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[async_trait]
impl IncidentProvider for PagerDutyClient {
    async fn current_user(&self) -> Result<User> {
        let body = self.send(self.client.get(self.url("/users/me"))).await?;
        let envelope: UserEnvelope = wire::decode(&body, "current user")?;
        Ok(envelope.user.into())
    }

    async fn list_services(&self) -> Result<Page<Service>> {
        let page = self
            .list_all::<WireService>("/services", "services", &[])
            .await?;
        Ok(Page {
            items: page.items.into_iter().map(Service::from).collect(),
            complete: page.complete,
        })
    }

    async fn list_users(&self) -> Result<Page<User>> {
        let page = self.list_all::<WireUser>("/users", "users", &[]).await?;
        Ok(Page {
            items: page.items.into_iter().map(User::from).collect(),
            complete: page.complete,
        })
    }

    async fn list_open_incidents(&self, filter: &ListFilter) -> Result<Page<Incident>> {
        self.list_incidents(
            &[IncidentStatus::Triggered, IncidentStatus::Acknowledged],
            None,
            filter,
        )
        .await
    }

    async fn list_resolved_incidents(
        &self,
        since: DateTime<Utc>,
        filter: &ListFilter,
    ) -> Result<Page<Incident>> {
        self.list_incidents(&[IncidentStatus::Resolved], Some(since), filter)
            .await
    }

    async fn acknowledge(&self, incident_id: &str, from: &str) -> Result<()> {
        self.update_status(incident_id, from, IncidentStatus::Acknowledged)
            .await
    }

    async fn resolve(&self, incident_id: &str, from: &str) -> Result<()> {
        self.update_status(incident_id, from, IncidentStatus::Resolved)
            .await
    }

    async fn add_note(&self, incident_id: &str, from: &str, content: &str) -> Result<Note> {
        let request = self
            .client
            .post(self.url(&format!("/incidents/{}/notes", incident_id)))
            .header("From", from)
            .json(&NewNote {
                note: NoteContent { content },
            });
        let body = self.send(request).await?;
        let envelope: NoteEnvelope = wire::decode(&body, "note")?;
        info!(incident_id, "added note");
        Note::try_from(envelope.note)
    }

    async fn list_incident_alerts(&self, incident_id: &str) -> Result<Vec<Alert>> {
        let path = format!("/incidents/{}/alerts", incident_id);
        let page = self.list_all::<WireAlert>(&path, "alerts", &[]).await?;
        if !page.complete {
            warn!(incident_id, "alert listing truncated");
        }
        page.items.into_iter().map(Alert::try_from).collect()
    }

    async fn snooze(&self, incident_id: &str, from: &str, duration: Duration) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("/incidents/{}/snooze", incident_id)))
            .header("From", from)
            .json(&Snooze {
                duration: duration.as_secs(),
            });
        self.send(request).await?;
        info!(incident_id, duration_secs = duration.as_secs(), "snoozed incident");
        Ok(())
    }

    async fn escalate(&self, incident_id: &str, from: &str, level: u32) -> Result<()> {
        let request = self
            .client
            .put(self.url("/incidents"))
            .header("From", from)
            .json(&StatusUpdate::escalate(incident_id, level));
        self.send(request).await?;
        info!(incident_id, level, "escalated incident");
        Ok(())
    }

    async fn merge_incidents(
        &self,
        target_id: &str,
        source_ids: &[String],
        from: &str,
    ) -> Result<()> {
        let request = self
            .client
            .put(self.url(&format!("/incidents/{}/merge", target_id)))
            .header("From", from)
            .json(&Merge::from_sources(source_ids));
        self.send(request).await?;
        info!(target_id, sources = source_ids.len(), "merged incidents");
        Ok(())
    }

    fn name(&self) -> &str {
        "pagerduty"
    }
}
