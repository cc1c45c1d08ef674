//! The active provider, rebuilt whenever the api key changes.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::info;

use pagerops_core::{PagerOpsError, RemoteConfig, Result, User};
use pagerops_remote::{IncidentProvider, PagerDutyClient};

/// Builds a provider for an api key.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, api_key: &str) -> Result<Arc<dyn IncidentProvider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&str) -> Result<Arc<dyn IncidentProvider>> + Send + Sync,
{
    fn build(&self, api_key: &str) -> Result<Arc<dyn IncidentProvider>> {
        self(api_key)
    }
}

/// Builds [`PagerDutyClient`]s.
pub struct PagerDutyFactory {
    remote: RemoteConfig,
    timeout: Duration,
}

impl PagerDutyFactory {
    pub fn new(remote: RemoteConfig, timeout: Duration) -> Self {
        Self { remote, timeout }
    }
}

impl ProviderFactory for PagerDutyFactory {
    fn build(&self, api_key: &str) -> Result<Arc<dyn IncidentProvider>> {
        Ok(Arc::new(PagerDutyClient::new(api_key, &self.remote, self.timeout)?))
    }
}

struct Active {
    api_key: String,
    provider: Arc<dyn IncidentProvider>,
    current_user: Option<User>,
}

/// Holds the provider for the configured key and the user that key
/// belongs to.
pub struct ProviderSlot {
    factory: Arc<dyn ProviderFactory>,
    active: Mutex<Option<Active>>,
}

impl ProviderSlot {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
        }
    }

    /// Provider for `api_key`, building a new one when the key changed.
    pub fn provider_for(&self, api_key: Option<&str>) -> Result<Arc<dyn IncidentProvider>> {
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PagerOpsError::auth("no api key configured"))?;

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = active.as_ref()
            && current.api_key == api_key
        {
            return Ok(Arc::clone(&current.provider));
        }

        let provider = self.factory.build(api_key)?;
        info!(provider = provider.name(), "built incident provider");
        *active = Some(Active {
            api_key: api_key.to_string(),
            provider: Arc::clone(&provider),
            current_user: None,
        });
        Ok(provider)
    }

    /// The user fetched for the provider built from `api_key`, if known.
    pub fn current_user(&self, api_key: &str) -> Option<User> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active
            .as_ref()
            .filter(|a| a.api_key == api_key.trim())
            .and_then(|a| a.current_user.clone())
    }

    /// Remember the user behind `api_key`. Ignored if the key changed since.
    pub fn remember_user(&self, api_key: &str, user: User) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = active.as_mut()
            && current.api_key == api_key.trim()
        {
            current.current_user = Some(user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagerops_remote::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_slot() -> (Arc<AtomicUsize>, ProviderSlot) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let factory = move |_key: &str| -> Result<Arc<dyn IncidentProvider>> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockProvider::new()))
        };
        (builds, ProviderSlot::new(Arc::new(factory)))
    }

    #[test]
    fn test_rebuilds_only_on_key_change() {
        let (builds, slot) = counting_slot();
        slot.provider_for(Some("key-a")).unwrap();
        slot.provider_for(Some("key-a")).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        slot.remember_user("key-a", User::new("U1", "a@example.com", "A"));
        assert!(slot.current_user("key-a").is_some());

        slot.provider_for(Some("key-b")).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(slot.current_user("key-b").is_none());
    }

    #[test]
    fn test_missing_key_is_auth_error() {
        let (_builds, slot) = counting_slot();
        assert!(slot.provider_for(None).err().unwrap().is_auth_error());
        assert!(slot.provider_for(Some("   ")).err().unwrap().is_auth_error());
    }
}
