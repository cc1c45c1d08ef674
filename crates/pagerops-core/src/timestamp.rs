//! The single timestamp parsing/formatting routine.
//!
//! Provider payloads and SQLite rows both carry RFC 3339 strings. Every
//! conversion into a typed `DateTime<Utc>` goes through [`parse_timestamp`]
//! and every conversion back through [`format_timestamp`].

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{PagerOpsError, Result};

/// Parse an RFC 3339 timestamp (any offset) into UTC.
///
/// Also accepts the `YYYY-MM-DD HH:MM:SS` form SQLite produces for
/// `CURRENT_TIMESTAMP`, interpreted as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| PagerOpsError::TimestampParse {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Parse an optional timestamp; empty strings count as absent.
pub fn parse_optional_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_timestamp(v).map(Some),
        _ => Ok(None),
    }
}

/// Format a timestamp as RFC 3339 with second precision and a `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
