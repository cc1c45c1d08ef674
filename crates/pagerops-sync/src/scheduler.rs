//! Refresh scheduler.
//!
//! A single task owns the polling loop:
//!
//! ```text
//! Idle ──tick/refresh──▶ Fetching ──ok──▶ Idle
//!                           │
//!                           ├──auth error──▶ AuthPaused ──key changed──▶ Idle
//!                           └──other error─▶ Backoff ──delay elapsed──▶ Fetching
//! ```
//!
//! The fetch runs without touching the cache; only the merge that follows
//! takes the cache lock. Shutdown drops an in-flight fetch, so a merge is
//! either applied whole or not at all.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use pagerops_cache::{ReconcileReport, RemoteBatch, SyncCache};
use pagerops_core::recovery::jittered;
use pagerops_core::{
    BackoffPolicy, Incident, PagerOpsError, Result, Settings, SyncConfig, log_sync_event,
};

use crate::fetch::{FetchPlan, fetch_batch};
use crate::slot::ProviderSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Fetching,
    Backoff,
    AuthPaused,
    Stopped,
}

/// What the presentation layer shows about synchronization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SchedulerState,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// When the next automatic attempt is due, while backing off.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub guidance: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            last_success_at: None,
            last_attempt_at: None,
            consecutive_failures: 0,
            next_attempt_at: None,
            message: None,
            guidance: None,
        }
    }
}

/// Reply to a manual refresh.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Synced(ReconcileReport),
    Failed { message: String },
    /// Backing off; nothing was fetched.
    Deferred { retry_at: DateTime<Utc> },
    /// Paused until the api key changes.
    AuthRequired,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub fetch_timeout: Duration,
    pub jitter_ratio: f64,
    pub backoff: BackoffPolicy,
    pub resolved_window: chrono::Duration,
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            jitter_ratio: config.jitter_ratio,
            backoff: config.backoff_policy(),
            resolved_window: config.resolved_window(),
        }
    }
}

enum Command {
    Refresh(oneshot::Sender<RefreshOutcome>),
    Shutdown(oneshot::Sender<()>),
}

/// Control side of a running scheduler.
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SyncStatus>,
    triggered: broadcast::Sender<Vec<Incident>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Start polling. The first fetch begins immediately.
    pub fn spawn(
        cache: Arc<SyncCache>,
        slot: Arc<ProviderSlot>,
        settings: watch::Receiver<Settings>,
        config: SchedulerConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SyncStatus::default());
        let (triggered, _) = broadcast::channel(16);

        let scheduler = Scheduler {
            cache,
            slot,
            settings,
            settings_open: true,
            config,
            commands: command_rx,
            status: status_tx,
            triggered: triggered.clone(),
            failures: 0,
            paused_key: None,
            idle_since: Instant::now(),
        };
        let task = tokio::spawn(scheduler.run());

        Self {
            commands,
            status,
            triggered,
            task: Mutex::new(Some(task)),
        }
    }

    /// Fetch now, or join the fetch already running.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        let (reply, outcome) = oneshot::channel();
        if self.commands.send(Command::Refresh(reply)).is_err() {
            return RefreshOutcome::Stopped;
        }
        outcome.await.unwrap_or(RefreshOutcome::Stopped)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Incidents that newly entered `triggered`, one message per merge.
    pub fn subscribe_triggered(&self) -> broadcast::Receiver<Vec<Incident>> {
        self.triggered.subscribe()
    }

    /// Stop polling, abandoning any fetch in flight.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Scheduler {
    cache: Arc<SyncCache>,
    slot: Arc<ProviderSlot>,
    settings: watch::Receiver<Settings>,
    settings_open: bool,
    config: SchedulerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<SyncStatus>,
    triggered: broadcast::Sender<Vec<Incident>>,
    failures: u32,
    /// The key that was rejected, while auth-paused.
    paused_key: Option<String>,
    idle_since: Instant,
}

impl Scheduler {
    async fn run(mut self) {
        info!("refresh scheduler started");
        let mut next_at = Instant::now();

        loop {
            let state = self.status.borrow().state;
            if state == SchedulerState::AuthPaused {
                if !self.wait_for_new_key().await {
                    break;
                }
                next_at = Instant::now();
                continue;
            }

            let cycle = tokio::select! {
                _ = sleep_until(next_at) => Some(Vec::new()),
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(reply)) if state == SchedulerState::Backoff => {
                        let retry_at = self.status.borrow().next_attempt_at.unwrap_or_else(Utc::now);
                        debug!(%retry_at, "manual refresh deferred by backoff");
                        let _ = reply.send(RefreshOutcome::Deferred { retry_at });
                        None
                    }
                    Some(Command::Refresh(reply)) => Some(vec![reply]),
                    Some(Command::Shutdown(ack)) => {
                        self.stop();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                changed = self.settings.changed(), if state == SchedulerState::Idle && self.settings_open => {
                    if changed.is_err() {
                        self.settings_open = false;
                    } else {
                        // Interval edits apply to the wait already under way.
                        let settings = self.settings.borrow_and_update().clone();
                        next_at = self.idle_since + self.poll_delay(&settings);
                    }
                    None
                }
            };

            if let Some(waiters) = cycle {
                match self.cycle(waiters).await {
                    Some(next) => next_at = next,
                    None => break,
                }
            }
        }
        info!("refresh scheduler stopped");
    }

    /// One fetch and merge. Returns when the next automatic attempt is
    /// due, or `None` if the scheduler was shut down meanwhile.
    async fn cycle(&mut self, mut waiters: Vec<oneshot::Sender<RefreshOutcome>>) -> Option<Instant> {
        let settings = self.settings.borrow_and_update().clone();
        self.status.send_modify(|s| {
            s.state = SchedulerState::Fetching;
            s.last_attempt_at = Some(Utc::now());
        });
        log_sync_event!("fetch_started", failures = self.failures);

        let fetch = fetch_remote(Arc::clone(&self.slot), settings.clone(), self.config.clone());
        tokio::pin!(fetch);
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        debug!("manual refresh joined in-flight fetch");
                        waiters.push(reply);
                    }
                    Some(Command::Shutdown(ack)) => {
                        log_sync_event!("fetch_abandoned");
                        self.stop();
                        let _ = ack.send(());
                        return None;
                    }
                    None => {
                        self.stop();
                        return None;
                    }
                },
            }
        };

        let (outcome, next) = match result {
            Ok(batch) => self.on_success(batch, &settings),
            Err(e) => self.on_failure(e, &settings),
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        Some(next)
    }

    fn on_success(&mut self, batch: RemoteBatch, settings: &Settings) -> (RefreshOutcome, Instant) {
        let first_sync = self.status.borrow().last_success_at.is_none();
        let (report, pruned) = self.cache.apply_poll(batch, Utc::now());
        self.failures = 0;

        log_sync_event!(
            "fetch_succeeded",
            inserted = report.inserted,
            updated = report.updated,
            moved = report.moved,
            pruned = pruned.len()
        );

        // Everything is new on the first sync; only later arrivals are news.
        if !first_sync && !report.newly_triggered.is_empty() {
            let incidents: Vec<Incident> = report
                .newly_triggered
                .iter()
                .filter_map(|id| self.cache.incident(id))
                .collect();
            info!(count = incidents.len(), "new triggered incidents");
            let _ = self.triggered.send(incidents);
        }

        self.status.send_modify(|s| {
            s.state = SchedulerState::Idle;
            s.last_success_at = Some(Utc::now());
            s.consecutive_failures = 0;
            s.next_attempt_at = None;
            s.message = None;
            s.guidance = None;
        });
        self.idle_since = Instant::now();
        (
            RefreshOutcome::Synced(report),
            self.idle_since + self.poll_delay(settings),
        )
    }

    fn on_failure(&mut self, error: PagerOpsError, settings: &Settings) -> (RefreshOutcome, Instant) {
        if error.is_auth_error() {
            warn!(error = %error, "provider rejected credentials; polling paused");
            log_sync_event!("auth_paused");
            self.paused_key = settings.api_key.clone();
            self.status.send_modify(|s| {
                s.state = SchedulerState::AuthPaused;
                s.next_attempt_at = None;
                s.message = Some(error.friendly_message());
                s.guidance = error.guidance().map(str::to_string);
            });
            return (RefreshOutcome::AuthRequired, Instant::now());
        }

        self.failures += 1;
        let delay = self
            .config
            .backoff
            .delay_with_retry_after(self.failures, error.retry_after_secs());
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let failures = self.failures;
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(error = %error, failures, delay_ms, "fetch failed; backing off");
        log_sync_event!("backoff", failures, delay_ms);

        self.status.send_modify(|s| {
            s.state = SchedulerState::Backoff;
            s.consecutive_failures = failures;
            s.next_attempt_at = Some(retry_at);
            s.message = Some(error.friendly_message());
            s.guidance = error.guidance().map(str::to_string);
        });
        (
            RefreshOutcome::Failed {
                message: error.to_string(),
            },
            Instant::now() + delay,
        )
    }

    /// Wait in `AuthPaused`. Returns false on shutdown.
    async fn wait_for_new_key(&mut self) -> bool {
        loop {
            tokio::select! {
                changed = self.settings.changed(), if self.settings_open => {
                    if changed.is_err() {
                        self.settings_open = false;
                        continue;
                    }
                    let key = self.settings.borrow_and_update().api_key.clone();
                    if key != self.paused_key {
                        log_sync_event!("auth_resumed");
                        self.paused_key = None;
                        self.failures = 0;
                        self.status.send_modify(|s| {
                            s.state = SchedulerState::Idle;
                            s.consecutive_failures = 0;
                            s.message = None;
                            s.guidance = None;
                        });
                        return true;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Refresh(reply)) => {
                        let _ = reply.send(RefreshOutcome::AuthRequired);
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.stop();
                        let _ = ack.send(());
                        return false;
                    }
                    None => {
                        self.stop();
                        return false;
                    }
                },
            }
        }
    }

    fn poll_delay(&self, settings: &Settings) -> Duration {
        jittered(settings.refresh_interval(), self.config.jitter_ratio)
    }

    fn stop(&mut self) {
        log_sync_event!("stopped");
        self.status.send_modify(|s| {
            s.state = SchedulerState::Stopped;
            s.next_attempt_at = None;
        });
    }
}

/// Resolve the provider and fetch one batch within the configured timeout.
async fn fetch_remote(
    slot: Arc<ProviderSlot>,
    settings: Settings,
    config: SchedulerConfig,
) -> Result<RemoteBatch> {
    let api_key = settings.api_key.as_deref();
    let provider = slot.provider_for(api_key)?;
    let plan = FetchPlan {
        current_user: api_key.and_then(|k| slot.current_user(k)),
        assigned_only: settings.assigned_only,
        resolved_since: Utc::now() - config.resolved_window,
    };

    let batch = match timeout(config.fetch_timeout, fetch_batch(provider.as_ref(), plan)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(PagerOpsError::Timeout {
                timeout_secs: config.fetch_timeout.as_secs(),
            });
        }
    };

    if let (Some(key), Some(user)) = (api_key, batch.current_user.as_ref()) {
        slot.remember_user(key, user.clone());
    }
    Ok(batch)
}
