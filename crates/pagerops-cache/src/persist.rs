//! Persistence collaborators.
//!
//! The cache never talks to disk directly. Settings, drafts, templates and
//! local overrides go through these traits; `pagerops-db` implements them on
//! SQLite and [`MemoryStore`] implements them in memory for tests and for
//! running without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use pagerops_core::{
    DraftNote, EntityKind, IncidentId, PagerOpsError, Result, ServiceId, Settings, Template, TemplateId,
};

/// Local-owned values that must outlive the records they apply to.
///
/// Seeded into the store at startup so that a service or incident seen
/// again after a restart keeps the user's choice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOverrides {
    pub service_active: BTreeMap<ServiceId, bool>,
    pub pinned_incidents: BTreeSet<IncidentId>,
}

impl LocalOverrides {
    pub fn service_active(&self, id: &str) -> Option<bool> {
        self.service_active.get(id).copied()
    }

    pub fn is_pinned(&self, id: &str) -> bool {
        self.pinned_incidents.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.service_active.is_empty() && self.pinned_incidents.is_empty()
    }
}

/// Key-value durability for [`Settings`].
pub trait SettingsStore: Send + Sync {
    fn load_settings(&self) -> Result<Settings>;
    fn save_settings(&self, settings: &Settings) -> Result<()>;
}

/// Durable copies of draft notes.
pub trait DraftStore: Send + Sync {
    fn load_drafts(&self) -> Result<Vec<DraftNote>>;
    fn save_draft(&self, draft: &DraftNote) -> Result<()>;
    fn delete_draft(&self, incident_id: &str) -> Result<()>;
}

/// Note templates.
pub trait TemplateStore: Send + Sync {
    fn list_templates(&self) -> Result<Vec<Template>>;
    /// Insert (id 0) or update a template, returning its id.
    fn save_template(&self, template: &Template) -> Result<TemplateId>;
    fn delete_template(&self, id: TemplateId) -> Result<()>;
}

/// Service `active` flags and incident pins.
pub trait OverrideStore: Send + Sync {
    fn load_overrides(&self) -> Result<LocalOverrides>;
    fn save_service_active(&self, service_id: &str, active: bool) -> Result<()>;
    fn save_pinned(&self, incident_id: &str, pinned: bool) -> Result<()>;
}

/// In-memory implementation of every persistence trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: Mutex<HashMap<String, String>>,
    drafts: Mutex<BTreeMap<IncidentId, DraftNote>>,
    templates: Mutex<BTreeMap<TemplateId, Template>>,
    overrides: Mutex<LocalOverrides>,
    draft_writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save_draft` calls so far.
    pub fn draft_writes(&self) -> usize {
        self.draft_writes.load(Ordering::SeqCst)
    }

    /// Durable copy of a draft, if any.
    pub fn stored_draft(&self, incident_id: &str) -> Option<DraftNote> {
        self.drafts.lock().ok()?.get(incident_id).cloned()
    }

    /// Make every subsequent write fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PagerOpsError::persistence(operation, "store is read-only"));
        }
        Ok(())
    }
}

fn poisoned(operation: &str) -> PagerOpsError {
    PagerOpsError::persistence(operation, "memory store lock poisoned")
}

impl SettingsStore for MemoryStore {
    fn load_settings(&self) -> Result<Settings> {
        let pairs = self.settings.lock().map_err(|_| poisoned("load settings"))?;
        Ok(Settings::from_pairs(&pairs))
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.check_writable("save settings")?;
        let mut pairs = self.settings.lock().map_err(|_| poisoned("save settings"))?;
        for (key, value) in settings.to_pairs() {
            pairs.insert(key.to_string(), value);
        }
        Ok(())
    }
}

impl DraftStore for MemoryStore {
    fn load_drafts(&self) -> Result<Vec<DraftNote>> {
        let drafts = self.drafts.lock().map_err(|_| poisoned("load drafts"))?;
        Ok(drafts.values().cloned().collect())
    }

    fn save_draft(&self, draft: &DraftNote) -> Result<()> {
        self.check_writable("save draft")?;
        self.drafts
            .lock()
            .map_err(|_| poisoned("save draft"))?
            .insert(draft.incident_id.clone(), draft.clone());
        self.draft_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_draft(&self, incident_id: &str) -> Result<()> {
        self.check_writable("delete draft")?;
        self.drafts
            .lock()
            .map_err(|_| poisoned("delete draft"))?
            .remove(incident_id);
        Ok(())
    }
}

impl TemplateStore for MemoryStore {
    fn list_templates(&self) -> Result<Vec<Template>> {
        let templates = self.templates.lock().map_err(|_| poisoned("list templates"))?;
        Ok(templates.values().cloned().collect())
    }

    fn save_template(&self, template: &Template) -> Result<TemplateId> {
        self.check_writable("save template")?;
        let mut templates = self.templates.lock().map_err(|_| poisoned("save template"))?;
        let id = if template.id == 0 {
            templates.keys().next_back().copied().unwrap_or(0) + 1
        } else if templates.contains_key(&template.id) {
            template.id
        } else {
            return Err(PagerOpsError::not_found(
                EntityKind::Template,
                template.id.to_string(),
            ));
        };
        templates.insert(
            id,
            Template {
                id,
                ..template.clone()
            },
        );
        Ok(id)
    }

    fn delete_template(&self, id: TemplateId) -> Result<()> {
        self.check_writable("delete template")?;
        self.templates
            .lock()
            .map_err(|_| poisoned("delete template"))?
            .remove(&id);
        Ok(())
    }
}

impl OverrideStore for MemoryStore {
    fn load_overrides(&self) -> Result<LocalOverrides> {
        Ok(self
            .overrides
            .lock()
            .map_err(|_| poisoned("load overrides"))?
            .clone())
    }

    fn save_service_active(&self, service_id: &str, active: bool) -> Result<()> {
        self.check_writable("save service override")?;
        self.overrides
            .lock()
            .map_err(|_| poisoned("save service override"))?
            .service_active
            .insert(service_id.to_string(), active);
        Ok(())
    }

    fn save_pinned(&self, incident_id: &str, pinned: bool) -> Result<()> {
        self.check_writable("save pin")?;
        let mut overrides = self.overrides.lock().map_err(|_| poisoned("save pin"))?;
        if pinned {
            overrides.pinned_incidents.insert(incident_id.to_string());
        } else {
            overrides.pinned_incidents.remove(incident_id);
        }
        Ok(())
    }
}
