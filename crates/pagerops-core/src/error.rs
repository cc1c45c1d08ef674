//! Error types for PagerOps operations.
//!
//! This module defines [`PagerOpsError`], the error enum shared by every
//! PagerOps crate. Errors fall into two propagation classes:
//!
//! - **Remote errors** (network, timeout, auth, rate limit, protocol, partial
//!   fetch) are caught at the refresh scheduler boundary and turned into a
//!   user-visible sync status. They never reach the entity store.
//! - **Local errors** (not found, no draft, validation, persistence) are
//!   returned directly to the command that caused them.
//!
//! No variant is fatal to the process.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::EntityKind;

/// Result type alias using [`PagerOpsError`].
pub type Result<T> = std::result::Result<T, PagerOpsError>;

/// Comprehensive error type for all PagerOps operations.
#[derive(Debug, Error)]
pub enum PagerOpsError {
    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// Transient network failure (connection refused, 5xx, reset)
    #[error("Network error: {message}")]
    TransientNetwork { message: String },

    /// Remote call exceeded its time budget
    #[error("Remote call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Provider rejected the request because of rate limiting
    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Provider rejected the credentials
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Provider answered with something we could not understand
    #[error("Unexpected provider response ({status}): {message}")]
    RemoteProtocol { status: u16, message: String },

    /// Provider returned an incomplete listing
    #[error("Partial fetch: {message}")]
    PartialFetch { message: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Local operation on an unknown id
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Commit requested for an incident without a draft
    #[error("No draft note for incident {incident_id}")]
    NoDraft { incident_id: String },

    /// Input rejected before any state was touched
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // Persistence / I/O Errors
    // =========================================================================
    /// Durable store failed
    #[error("Persistence error during {operation}: {message}")]
    Persistence { operation: String, message: String },

    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory creation failed
    #[error("Failed to create directory: {path}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Parsing Errors
    // =========================================================================
    /// JSON parsing error
    #[error("JSON parse error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// Timestamp could not be parsed
    #[error("Invalid timestamp {value:?}: {message}")]
    TimestampParse { value: String, message: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in PagerOps)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PagerOpsError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a NotFound error
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a NoDraft error
    pub fn no_draft(incident_id: impl Into<String>) -> Self {
        Self::NoDraft {
            incident_id: incident_id.into(),
        }
    }

    /// Create a Validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a transient network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify an HTTP status code returned by the provider.
    pub fn from_http_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth {
                message: format!("provider returned {}: {}", status, body),
            },
            429 => Self::RateLimited { retry_after_secs },
            408 | 500 | 502 | 503 | 504 => Self::TransientNetwork {
                message: format!("server error ({}): {}", status, body),
            },
            _ => Self::RemoteProtocol {
                status,
                message: body.to_string(),
            },
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true if the scheduler should retry this error after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::RemoteProtocol { .. }
                | Self::PartialFetch { .. }
        )
    }

    /// Returns true if this error means the api key is missing or rejected.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Returns true if this error originated from the remote provider.
    pub fn is_remote_error(&self) -> bool {
        self.is_retryable() || self.is_auth_error()
    }

    /// Provider-requested wait, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }

    /// Short message suitable for a status line.
    pub fn friendly_message(&self) -> String {
        match self {
            Self::TransientNetwork { .. } => "Cannot reach PagerDuty. Showing cached data.".into(),
            Self::Timeout { timeout_secs } => {
                format!("PagerDuty did not answer within {}s. Showing cached data.", timeout_secs)
            }
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => format!("Rate limited by PagerDuty. Retrying in {}s.", secs),
            Self::RateLimited { .. } => "Rate limited by PagerDuty. Backing off.".into(),
            Self::Auth { .. } => "PagerDuty rejected the API key.".into(),
            _ => self.to_string(),
        }
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::Auth { .. } => Some("Update the API key in settings ('pagerops set-api-key')"),
            Self::RateLimited { .. } => Some("Increase the refresh interval"),
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in ~/.pagerops/config.yaml"),
            Self::NoDraft { .. } => Some("Write a draft note before submitting it"),
            Self::TransientNetwork { .. } | Self::Timeout { .. } => {
                Some("Check your network connection")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        assert!(PagerOpsError::from_http_status(401, None, "").is_auth_error());
        assert!(PagerOpsError::from_http_status(403, None, "").is_auth_error());
        assert!(PagerOpsError::from_http_status(503, None, "").is_retryable());

        let limited = PagerOpsError::from_http_status(429, Some(30), "");
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after_secs(), Some(30));

        let other = PagerOpsError::from_http_status(400, None, "bad filter");
        assert!(matches!(other, PagerOpsError::RemoteProtocol { status: 400, .. }));
    }

    #[test]
    fn test_local_errors_are_not_remote() {
        let err = PagerOpsError::not_found(EntityKind::Incident, "P123");
        assert_eq!(err.to_string(), "incident not found: P123");
        assert!(!err.is_remote_error());

        let err = PagerOpsError::no_draft("P123");
        assert!(!err.is_retryable());
        assert!(err.guidance().is_some());
    }

    #[test]
    fn test_auth_is_not_retryable() {
        let err = PagerOpsError::auth("invalid token");
        assert!(!err.is_retryable());
        assert!(err.is_remote_error());
        assert_eq!(err.friendly_message(), "PagerDuty rejected the API key.");
    }
}
