//! User settings.
//!
//! Settings are loaded once at startup, changed at runtime, and persisted on
//! every change through a key-value store. The refresh scheduler re-reads
//! [`Settings::refresh_interval`] every cycle, so changes apply live.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PagerOpsError, Result};

/// Settings keys used by key-value persistence.
pub mod keys {
    pub const REFRESH_INTERVAL: &str = "refresh_interval";
    pub const SOUND_ENABLED: &str = "sound_enabled";
    pub const DESKTOP_NOTIFICATIONS: &str = "desktop_notifications";
    pub const THEME: &str = "theme";
    pub const COMPACT_VIEW: &str = "compact_view";
    pub const API_KEY: &str = "api_key";
    pub const ASSIGNED_ONLY: &str = "assigned_only";
    pub const REDIRECT_ENABLED: &str = "redirect_enabled";
    pub const SOUND_PATH: &str = "sound_path";
}

/// Lower bound for the poll interval.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 1000;

/// UI theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dark => "dark",
            Self::Light => "light",
        }
    }
}

/// Process-wide user settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub refresh_interval_ms: u64,
    pub sound_enabled: bool,
    pub desktop_notifications: bool,
    pub theme: Theme,
    pub compact_view: bool,
    pub api_key: Option<String>,
    /// Only fetch incidents assigned to the current user.
    pub assigned_only: bool,
    /// Open newly triggered incidents in the browser.
    pub redirect_enabled: bool,
    pub sound_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 3000,
            sound_enabled: true,
            desktop_notifications: true,
            theme: Theme::Dark,
            compact_view: false,
            api_key: None,
            assigned_only: false,
            redirect_enabled: false,
            sound_path: None,
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Returns true when an api key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// Copy with the api key replaced by `****` plus its last four characters.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.api_key = self.api_key.as_deref().map(mask_api_key);
        copy
    }

    /// Validate user-editable values.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(PagerOpsError::validation(
                keys::REFRESH_INTERVAL,
                format!(
                    "must be >= {}ms, got {}ms",
                    MIN_REFRESH_INTERVAL_MS, self.refresh_interval_ms
                ),
            ));
        }
        if let Some(key) = &self.api_key
            && is_masked(key)
        {
            return Err(PagerOpsError::validation(
                keys::API_KEY,
                "masked value cannot be stored",
            ));
        }
        Ok(())
    }

    /// Flatten into key-value pairs for persistence.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (keys::REFRESH_INTERVAL, self.refresh_interval_ms.to_string()),
            (keys::SOUND_ENABLED, self.sound_enabled.to_string()),
            (keys::DESKTOP_NOTIFICATIONS, self.desktop_notifications.to_string()),
            (keys::THEME, self.theme.as_str().to_string()),
            (keys::COMPACT_VIEW, self.compact_view.to_string()),
            (keys::API_KEY, self.api_key.clone().unwrap_or_default()),
            (keys::ASSIGNED_ONLY, self.assigned_only.to_string()),
            (keys::REDIRECT_ENABLED, self.redirect_enabled.to_string()),
            (keys::SOUND_PATH, self.sound_path.clone().unwrap_or_default()),
        ]
    }

    /// Rebuild from key-value pairs. Missing or malformed values fall back
    /// to defaults.
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| {
            pairs
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str, default: bool| match text(key).as_deref() {
            None => default,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                warn!(key, value = other, "ignoring malformed boolean setting");
                default
            }
        };

        let refresh_interval_ms = match text(keys::REFRESH_INTERVAL) {
            None => defaults.refresh_interval_ms,
            Some(v) => match v.parse::<u64>() {
                Ok(ms) => ms.max(MIN_REFRESH_INTERVAL_MS),
                Err(_) => {
                    warn!(value = %v, "ignoring malformed refresh interval");
                    defaults.refresh_interval_ms
                }
            },
        };
        let theme = match text(keys::THEME).as_deref() {
            Some("light") => Theme::Light,
            _ => Theme::Dark,
        };

        Self {
            refresh_interval_ms,
            sound_enabled: flag(keys::SOUND_ENABLED, defaults.sound_enabled),
            desktop_notifications: flag(keys::DESKTOP_NOTIFICATIONS, defaults.desktop_notifications),
            theme,
            compact_view: flag(keys::COMPACT_VIEW, defaults.compact_view),
            api_key: text(keys::API_KEY),
            assigned_only: flag(keys::ASSIGNED_ONLY, defaults.assigned_only),
            redirect_enabled: flag(keys::REDIRECT_ENABLED, defaults.redirect_enabled),
            sound_path: text(keys::SOUND_PATH),
        }
    }
}

/// Mask an api key for display.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("****{}", tail)
}

/// Returns true for values produced by [`mask_api_key`].
pub fn is_masked(key: &str) -> bool {
    key.starts_with("****")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_round_trip() {
        let settings = Settings {
            refresh_interval_ms: 5000,
            theme: Theme::Light,
            api_key: Some("u+abcdef1234".into()),
            assigned_only: true,
            sound_path: Some("/sounds".into()),
            ..Settings::default()
        };
        let map: HashMap<String, String> = settings
            .to_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(Settings::from_pairs(&map), settings);
    }

    #[test]
    fn test_from_pairs_falls_back_to_defaults() {
        let mut map = HashMap::new();
        map.insert(keys::SOUND_ENABLED.to_string(), "maybe".to_string());
        map.insert(keys::REFRESH_INTERVAL.to_string(), "soon".to_string());
        map.insert(keys::API_KEY.to_string(), "".to_string());
        let settings = Settings::from_pairs(&map);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_masking() {
        assert_eq!(mask_api_key("u+abcdef1234"), "****1234");
        assert_eq!(mask_api_key("ab"), "****ab");
        let masked = Settings {
            api_key: Some("secret-key-9876".into()),
            ..Settings::default()
        }
        .masked();
        assert_eq!(masked.api_key.as_deref(), Some("****9876"));
        assert!(masked.validate().is_err());
    }

    #[test]
    fn test_validate_interval() {
        let settings = Settings {
            refresh_interval_ms: 200,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }
}
