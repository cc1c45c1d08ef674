//! Persistence trait implementations over [`CacheDatabase`].

use pagerops_cache::{DraftStore, LocalOverrides, OverrideStore, SettingsStore, TemplateStore};
use pagerops_core::{DraftNote, EntityKind, PagerOpsError, Result, Settings, Template, TemplateId};

use crate::db::CacheDatabase;

impl SettingsStore for CacheDatabase {
    fn load_settings(&self) -> Result<Settings> {
        let pairs = self
            .setting_pairs()
            .map_err(|e| e.into_persistence("load settings"))?;
        Ok(Settings::from_pairs(&pairs))
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.put_settings(&settings.to_pairs())
            .map_err(|e| e.into_persistence("save settings"))
    }
}

impl DraftStore for CacheDatabase {
    fn load_drafts(&self) -> Result<Vec<DraftNote>> {
        self.drafts().map_err(|e| e.into_persistence("load drafts"))
    }

    fn save_draft(&self, draft: &DraftNote) -> Result<()> {
        self.upsert_draft(draft)
            .map_err(|e| e.into_persistence("save draft"))
    }

    fn delete_draft(&self, incident_id: &str) -> Result<()> {
        self.remove_draft(incident_id)
            .map(|_| ())
            .map_err(|e| e.into_persistence("delete draft"))
    }
}

impl TemplateStore for CacheDatabase {
    fn list_templates(&self) -> Result<Vec<Template>> {
        self.templates()
            .map_err(|e| e.into_persistence("list templates"))
    }

    fn save_template(&self, template: &Template) -> Result<TemplateId> {
        if template.id == 0 {
            return self
                .insert_template(&template.title, &template.body_text)
                .map_err(|e| e.into_persistence("insert template"));
        }
        let found = self
            .update_template(template)
            .map_err(|e| e.into_persistence("update template"))?;
        if !found {
            return Err(PagerOpsError::not_found(
                EntityKind::Template,
                template.id.to_string(),
            ));
        }
        Ok(template.id)
    }

    fn delete_template(&self, id: TemplateId) -> Result<()> {
        self.remove_template(id)
            .map(|_| ())
            .map_err(|e| e.into_persistence("delete template"))
    }
}

impl OverrideStore for CacheDatabase {
    fn load_overrides(&self) -> Result<LocalOverrides> {
        self.overrides()
            .map_err(|e| e.into_persistence("load overrides"))
    }

    fn save_service_active(&self, service_id: &str, active: bool) -> Result<()> {
        self.put_service_active(service_id, active)
            .map_err(|e| e.into_persistence("save service override"))
    }

    fn save_pinned(&self, incident_id: &str, pinned: bool) -> Result<()> {
        self.put_pinned(incident_id, pinned)
            .map_err(|e| e.into_persistence("save pin"))
    }
}
