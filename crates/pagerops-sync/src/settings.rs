//! Live settings.
//!
//! The current [`Settings`] are published on a watch channel so the
//! scheduler picks up a new interval or api key on its next cycle. Every
//! change is persisted before it is published.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use pagerops_cache::SettingsStore;
use pagerops_core::settings::is_masked;
use pagerops_core::{Result, Settings};

pub struct SettingsManager {
    store: Arc<dyn SettingsStore>,
    tx: watch::Sender<Settings>,
}

impl SettingsManager {
    /// Load settings from `store`, falling back to defaults on failure.
    pub fn load(store: Arc<dyn SettingsStore>) -> Self {
        let settings = match store.load_settings() {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "failed to load settings, using defaults");
                Settings::default()
            }
        };
        let (tx, _) = watch::channel(settings);
        Self { store, tx }
    }

    /// Unmasked current settings, for internal consumers.
    pub fn current(&self) -> Settings {
        self.tx.borrow().clone()
    }

    /// Current settings as shown to users.
    pub fn masked(&self) -> Settings {
        self.tx.borrow().masked()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Validate, persist and publish `settings`.
    ///
    /// A masked api key (as returned by [`masked`](Self::masked)) keeps the
    /// stored key. Returns the masked result.
    pub fn update(&self, mut settings: Settings) -> Result<Settings> {
        if settings.api_key.as_deref().is_some_and(is_masked) {
            settings.api_key = self.tx.borrow().api_key.clone();
        }
        if settings.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            settings.api_key = None;
        }
        settings.validate()?;
        self.store.save_settings(&settings)?;

        let key_changed = self.tx.borrow().api_key != settings.api_key;
        info!(
            refresh_interval_ms = settings.refresh_interval_ms,
            assigned_only = settings.assigned_only,
            key_changed,
            "settings updated"
        );
        let masked = settings.masked();
        self.tx.send_replace(settings);
        Ok(masked)
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) -> Result<Settings> {
        let mut settings = self.current();
        settings.api_key = Some(api_key.into());
        self.update(settings)
    }
}
