//! The command facade presentation layers talk to.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use pagerops_cache::{
    CacheOptions, CacheSnapshot, DraftManager, DraftStore, MemoryStore, OverrideStore,
    SettingsStore, SubscriptionId, SyncCache, TemplateStore,
};
use pagerops_core::{
    Alert, DraftFields, DraftNote, EngineConfig, EntityKind, Incident, IncidentStatus, Note,
    PagerOpsError, Result, Settings, Template, TemplateId,
};
use pagerops_remote::IncidentProvider;

use crate::scheduler::{RefreshOutcome, SchedulerConfig, SchedulerHandle, SyncStatus};
use crate::settings::SettingsManager;
use crate::slot::{ProviderFactory, ProviderSlot};

/// The persistence collaborators.
#[derive(Clone)]
pub struct Stores {
    pub settings: Arc<dyn SettingsStore>,
    pub drafts: Arc<dyn DraftStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub overrides: Arc<dyn OverrideStore>,
}

impl Stores {
    /// Use one backend for everything.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SettingsStore + DraftStore + TemplateStore + OverrideStore + 'static,
    {
        Self {
            settings: Arc::clone(&store) as Arc<dyn SettingsStore>,
            drafts: Arc::clone(&store) as Arc<dyn DraftStore>,
            templates: Arc::clone(&store) as Arc<dyn TemplateStore>,
            overrides: store as Arc<dyn OverrideStore>,
        }
    }

    /// Nothing survives the process.
    pub fn memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()))
    }
}

/// A running engine: cache, drafts, settings and the refresh scheduler.
pub struct PagerOps {
    cache: Arc<SyncCache>,
    drafts: DraftManager,
    settings: SettingsManager,
    slot: Arc<ProviderSlot>,
    scheduler: SchedulerHandle,
    stores: Stores,
}

fn already_resolved(incident_id: &str) -> PagerOpsError {
    PagerOpsError::validation("status", format!("incident {} is already resolved", incident_id))
}

impl PagerOps {
    /// Restore local state and start polling. Must be called inside a
    /// tokio runtime.
    pub fn start(config: &EngineConfig, stores: Stores, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        let cache = Arc::new(SyncCache::new(CacheOptions::from(&config.sync)));
        let settings = SettingsManager::load(Arc::clone(&stores.settings));

        match stores.overrides.load_overrides() {
            Ok(overrides) => cache.seed_overrides(overrides),
            Err(e) => warn!(error = %e, "failed to load local overrides"),
        }
        match stores.templates.list_templates() {
            Ok(templates) => cache.load_templates(templates),
            Err(e) => warn!(error = %e, "failed to load templates"),
        }

        let drafts = DraftManager::spawn(
            Arc::clone(&cache),
            Arc::clone(&stores.drafts),
            config.drafts.debounce(),
        );
        if let Err(e) = drafts.load_persisted() {
            warn!(error = %e, "failed to restore drafts");
        }

        let slot = Arc::new(ProviderSlot::new(factory));
        let scheduler = SchedulerHandle::spawn(
            Arc::clone(&cache),
            Arc::clone(&slot),
            settings.subscribe(),
            SchedulerConfig::from(&config.sync),
        );
        info!("engine started");

        Ok(Self {
            cache,
            drafts,
            settings,
            slot,
            scheduler,
            stores,
        })
    }

    // =========================================================================
    // Reading
    // =========================================================================

    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.cache.snapshot()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<CacheSnapshot>) + Send + Sync + 'static,
    {
        self.cache.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cache.unsubscribe(id)
    }

    pub fn watch(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.cache.watch()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.scheduler.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.scheduler.subscribe_status()
    }

    /// Newly triggered incidents, for notification hooks.
    pub fn subscribe_triggered(&self) -> broadcast::Receiver<Vec<Incident>> {
        self.scheduler.subscribe_triggered()
    }

    pub async fn refresh_now(&self) -> RefreshOutcome {
        self.scheduler.refresh_now().await
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Current settings with the api key masked.
    pub fn settings(&self) -> Settings {
        self.settings.masked()
    }

    pub fn update_settings(&self, settings: Settings) -> Result<Settings> {
        self.settings.update(settings)
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) -> Result<Settings> {
        self.settings.set_api_key(api_key)
    }

    // =========================================================================
    // Local overrides
    // =========================================================================

    /// Flip a service's `active` flag. Returns the new value.
    pub fn toggle_service(&self, service_id: &str) -> Result<bool> {
        let service = self
            .cache
            .service(service_id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Service, service_id))?;
        self.set_service_active(service_id, !service.active)?;
        Ok(!service.active)
    }

    pub fn set_service_active(&self, service_id: &str, active: bool) -> Result<()> {
        self.cache.set_service_active(service_id, active)?;
        if let Err(e) = self.stores.overrides.save_service_active(service_id, active) {
            warn!(service_id, error = %e, "service toggle not persisted");
        }
        Ok(())
    }

    pub fn pin_incident(&self, incident_id: &str, pinned: bool) -> Result<()> {
        self.cache.set_incident_pinned(incident_id, pinned)?;
        if let Err(e) = self.stores.overrides.save_pinned(incident_id, pinned) {
            warn!(incident_id, error = %e, "pin not persisted");
        }
        Ok(())
    }

    // =========================================================================
    // Incident actions
    // =========================================================================

    pub async fn acknowledge(&self, incident_id: &str) -> Result<()> {
        self.change_status(incident_id, IncidentStatus::Acknowledged)
            .await
    }

    pub async fn resolve(&self, incident_id: &str) -> Result<()> {
        self.change_status(incident_id, IncidentStatus::Resolved)
            .await
    }

    async fn change_status(&self, incident_id: &str, status: IncidentStatus) -> Result<()> {
        let incident = self.known_incident(incident_id)?;
        if incident.status.rank() >= status.rank() {
            return Err(PagerOpsError::validation(
                "status",
                format!("incident {} is already {}", incident_id, incident.status),
            ));
        }

        self.optimistic(status.as_str(), &[(incident_id, status)], |provider, from| async move {
            match status {
                IncidentStatus::Acknowledged => provider.acknowledge(incident_id, &from).await,
                IncidentStatus::Resolved => provider.resolve(incident_id, &from).await,
                IncidentStatus::Triggered => Err(PagerOpsError::validation(
                    "status",
                    "incidents cannot be re-triggered",
                )),
            }
        })
        .await
    }

    /// Silence an open incident for `duration`. A triggered incident shows
    /// as acknowledged until the provider answers.
    pub async fn snooze(&self, incident_id: &str, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Err(PagerOpsError::validation("duration", "must be positive"));
        }
        let incident = self.known_incident(incident_id)?;
        let pending = match incident.status {
            IncidentStatus::Resolved => return Err(already_resolved(incident_id)),
            IncidentStatus::Triggered => vec![(incident_id, IncidentStatus::Acknowledged)],
            IncidentStatus::Acknowledged => Vec::new(),
        };

        self.optimistic("snooze", &pending, |provider, from| async move {
            provider.snooze(incident_id, &from, duration).await
        })
        .await
    }

    /// Move an open incident to escalation `level`. An acknowledged
    /// incident shows as triggered until the provider answers.
    ///
    /// The local status only holds until the next poll: a remote
    /// `acknowledged` outranks the pending `triggered`.
    pub async fn escalate(&self, incident_id: &str, level: u32) -> Result<()> {
        if level == 0 {
            return Err(PagerOpsError::validation("escalation_level", "must be at least 1"));
        }
        let incident = self.known_incident(incident_id)?;
        let pending = match incident.status {
            IncidentStatus::Resolved => return Err(already_resolved(incident_id)),
            IncidentStatus::Acknowledged => vec![(incident_id, IncidentStatus::Triggered)],
            IncidentStatus::Triggered => Vec::new(),
        };

        self.optimistic("escalate", &pending, |provider, from| async move {
            provider.escalate(incident_id, &from, level).await
        })
        .await
    }

    /// Merge `source_ids` into `target_id`. The open sources show as
    /// resolved until the provider answers.
    pub async fn merge_incidents(&self, target_id: &str, source_ids: &[String]) -> Result<()> {
        if source_ids.is_empty() {
            return Err(PagerOpsError::validation("source_ids", "at least one incident is required"));
        }
        if source_ids.iter().any(|id| id == target_id) {
            return Err(PagerOpsError::validation(
                "source_ids",
                "an incident cannot be merged into itself",
            ));
        }
        if !self.known_incident(target_id)?.is_open() {
            return Err(already_resolved(target_id));
        }
        let mut pending = Vec::with_capacity(source_ids.len());
        for id in source_ids {
            if self.known_incident(id)?.is_open() {
                pending.push((id.as_str(), IncidentStatus::Resolved));
            }
        }

        self.optimistic("merge", &pending, |provider, from| async move {
            provider.merge_incidents(target_id, source_ids, &from).await
        })
        .await
    }

    /// Alerts grouped under an incident, fetched from the provider.
    pub async fn incident_alerts(&self, incident_id: &str) -> Result<Vec<Alert>> {
        let settings = self.settings.current();
        let provider = self.slot.provider_for(settings.api_key.as_deref())?;
        provider.list_incident_alerts(incident_id).await
    }

    fn known_incident(&self, incident_id: &str) -> Result<Incident> {
        self.cache
            .incident(incident_id)
            .ok_or_else(|| PagerOpsError::not_found(EntityKind::Incident, incident_id))
    }

    /// Apply `pending` locally, then run `send` against the provider.
    /// Every local change is undone if any step fails.
    async fn optimistic<F, Fut>(
        &self,
        action: &str,
        pending: &[(&str, IncidentStatus)],
        send: F,
    ) -> Result<()>
    where
        F: FnOnce(Arc<dyn IncidentProvider>, String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut applied = Vec::with_capacity(pending.len());
        let mut result = Ok(());
        for &(incident_id, status) in pending {
            if let Err(e) = self.cache.set_pending_status(incident_id, status) {
                result = Err(e);
                break;
            }
            applied.push(incident_id);
        }
        if result.is_ok() {
            result = match self.acting_provider().await {
                Ok((provider, from)) => send(provider, from).await,
                Err(e) => Err(e),
            };
        }

        match result {
            Ok(()) => {
                info!(action, incidents = ?applied, "incident action accepted");
                Ok(())
            }
            Err(e) => {
                warn!(action, incidents = ?applied, error = %e, "incident action rejected; reverting");
                for incident_id in applied {
                    if let Err(revert) = self.cache.clear_pending(incident_id, true) {
                        warn!(incident_id, error = %revert, "revert failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// The provider for the configured key and the email of the user that
    /// key belongs to.
    async fn acting_provider(&self) -> Result<(Arc<dyn IncidentProvider>, String)> {
        let settings = self.settings.current();
        let api_key = settings.api_key.as_deref();
        let provider = self.slot.provider_for(api_key)?;
        if let Some(user) = api_key.and_then(|key| self.slot.current_user(key)) {
            return Ok((provider, user.email));
        }
        let user = provider.current_user().await?;
        if let Some(key) = api_key {
            self.slot.remember_user(key, user.clone());
        }
        Ok((provider, user.email))
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    pub fn get_draft(&self, incident_id: &str) -> Option<DraftNote> {
        self.drafts.get_draft(incident_id)
    }

    pub fn set_draft(&self, incident_id: &str, fields: DraftFields) -> DraftNote {
        self.drafts.set_draft(incident_id, fields)
    }

    pub fn discard_draft(&self, incident_id: &str) -> bool {
        self.drafts.discard_draft(incident_id)
    }

    /// Turn the draft into a note locally, then post it to the provider.
    ///
    /// The local note stands even when posting fails.
    pub async fn commit_draft(&self, incident_id: &str) -> Result<Note> {
        let note = self.drafts.commit_draft(incident_id)?;
        match self.acting_provider().await {
            Ok((provider, from)) => {
                if let Err(e) = provider.add_note(incident_id, &from, &note.content).await {
                    warn!(incident_id, error = %e, "note kept locally; provider rejected it");
                }
            }
            Err(e) => warn!(incident_id, error = %e, "note kept locally; no provider"),
        }
        Ok(note)
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn templates(&self) -> Vec<Template> {
        self.cache.templates()
    }

    pub fn create_template(&self, title: &str, body_text: &str) -> Result<Template> {
        self.save_template(Template {
            id: 0,
            title: title.to_string(),
            body_text: body_text.to_string(),
        })
    }

    pub fn update_template(&self, template: Template) -> Result<Template> {
        if template.id == 0 {
            return Err(PagerOpsError::validation("id", "template has not been created"));
        }
        self.save_template(template)
    }

    fn save_template(&self, mut template: Template) -> Result<Template> {
        if template.title.trim().is_empty() {
            return Err(PagerOpsError::validation("title", "must not be empty"));
        }
        template.id = self.stores.templates.save_template(&template)?;
        self.cache.put_template(template.clone());
        Ok(template)
    }

    /// Remove a template from the store, then from the cache. A failed
    /// store delete leaves the template listed.
    pub fn delete_template(&self, id: TemplateId) -> Result<()> {
        if !self.cache.templates().iter().any(|t| t.id == id) {
            return Err(PagerOpsError::not_found(EntityKind::Template, id.to_string()));
        }
        self.stores.templates.delete_template(id)?;
        self.cache.remove_template(id)?;
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop polling and flush pending draft writes.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.drafts.shutdown().await;
        info!("engine stopped");
    }
}
