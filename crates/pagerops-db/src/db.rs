//! SQLite database for settings, drafts, templates and local overrides.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use pagerops_cache::LocalOverrides;
use pagerops_core::timestamp::{format_timestamp, parse_timestamp};
use pagerops_core::{DraftNote, Template, TemplateId};

use crate::error::{DbError, Result};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 2;

/// Maximum retries for database lock errors.
const DB_LOCK_MAX_RETRIES: u32 = 5;

/// Initial delay for database lock retry (in milliseconds).
const DB_LOCK_INITIAL_DELAY_MS: u64 = 50;

/// Maximum delay for database lock retry.
const DB_LOCK_MAX_DELAY: Duration = Duration::from_secs(2);

/// SQLite-backed local state.
pub struct CacheDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl CacheDatabase {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(1))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        info!(path = %path.display(), "opened local database");
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DbError::LockPoisoned(e.to_string()))
    }

    /// Run `f` against the connection, retrying with backoff while the
    /// database is locked by another process.
    fn with_retry<T, F>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> Result<T>,
    {
        let mut attempt = 0;
        let mut delay = Duration::from_millis(DB_LOCK_INITIAL_DELAY_MS);

        loop {
            attempt += 1;
            let result = {
                let mut conn = self.lock()?;
                f(&mut conn)
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, operation, "Database operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(ref e) if e.is_database_locked() && attempt <= DB_LOCK_MAX_RETRIES => {
                    warn!(
                        attempt,
                        max_retries = DB_LOCK_MAX_RETRIES,
                        delay_ms = delay.as_millis(),
                        operation,
                        "Database locked, retrying with backoff"
                    );
                    std::thread::sleep(delay);
                    delay = std::cmp::min(delay * 2, DB_LOCK_MAX_DELAY);
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!(attempt, operation, error = %e, "Database operation failed after retries");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Schema version currently applied.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .map_err(|e| DbError::Migration(format!("failed to read schema version: {}", e)))?;

        if current_version < SCHEMA_VERSION {
            info!(
                current = current_version,
                target = SCHEMA_VERSION,
                "Running database migrations"
            );
            if current_version < 1 {
                migration_v1(&conn)?;
            }
            if current_version < 2 {
                migration_v2(&conn)?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_retry("get setting", |conn| {
            Ok(conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?)
        })
    }

    pub fn setting_pairs(&self) -> Result<HashMap<String, String>> {
        self.with_retry("load settings", |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<HashMap<String, String>>>()?)
        })
    }

    /// Upsert every pair in one transaction.
    pub fn put_settings(&self, pairs: &[(&str, String)]) -> Result<()> {
        self.with_retry("save settings", |conn| {
            let tx = conn.transaction()?;
            for (key, value) in pairs {
                tx.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    pub fn drafts(&self) -> Result<Vec<DraftNote>> {
        let rows = self.with_retry("load drafts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT incident_id, note_text, why_triggered, impact, actions, links, last_updated
                 FROM draft_notes ORDER BY incident_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    DraftNote {
                        incident_id: row.get(0)?,
                        note_text: row.get(1)?,
                        why_triggered: row.get(2)?,
                        impact: row.get(3)?,
                        actions: row.get(4)?,
                        links: row.get(5)?,
                        last_updated: Utc::now(),
                    },
                    row.get::<_, String>(6)?,
                ))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        let mut drafts = Vec::with_capacity(rows.len());
        for (mut draft, last_updated) in rows {
            match parse_timestamp(&last_updated) {
                Ok(ts) => draft.last_updated = ts,
                Err(e) => {
                    warn!(incident_id = %draft.incident_id, error = %e, "draft has unreadable timestamp");
                }
            }
            drafts.push(draft);
        }
        Ok(drafts)
    }

    pub fn upsert_draft(&self, draft: &DraftNote) -> Result<()> {
        let last_updated = format_timestamp(&draft.last_updated);
        self.with_retry("save draft", |conn| {
            conn.execute(
                "INSERT INTO draft_notes
                    (incident_id, note_text, why_triggered, impact, actions, links, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(incident_id) DO UPDATE SET
                    note_text = excluded.note_text,
                    why_triggered = excluded.why_triggered,
                    impact = excluded.impact,
                    actions = excluded.actions,
                    links = excluded.links,
                    last_updated = excluded.last_updated",
                params![
                    draft.incident_id,
                    draft.note_text,
                    draft.why_triggered,
                    draft.impact,
                    draft.actions,
                    draft.links,
                    last_updated
                ],
            )?;
            Ok(())
        })?;
        debug!(incident_id = %draft.incident_id, "draft row written");
        Ok(())
    }

    pub fn remove_draft(&self, incident_id: &str) -> Result<bool> {
        self.with_retry("delete draft", |conn| {
            let removed = conn.execute("DELETE FROM draft_notes WHERE incident_id = ?1", [incident_id])?;
            Ok(removed > 0)
        })
    }

    // =========================================================================
    // Templates
    // =========================================================================

    pub fn templates(&self) -> Result<Vec<Template>> {
        self.with_retry("list templates", |conn| {
            let mut stmt = conn.prepare("SELECT id, title, body_text FROM templates ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(Template {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    body_text: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Insert a template and return its new id.
    pub fn insert_template(&self, title: &str, body_text: &str) -> Result<TemplateId> {
        self.with_retry("insert template", |conn| {
            conn.execute(
                "INSERT INTO templates (title, body_text) VALUES (?1, ?2)",
                params![title, body_text],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Returns false when no template has this id.
    pub fn update_template(&self, template: &Template) -> Result<bool> {
        self.with_retry("update template", |conn| {
            let changed = conn.execute(
                "UPDATE templates SET title = ?1, body_text = ?2 WHERE id = ?3",
                params![template.title, template.body_text, template.id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_template(&self, id: TemplateId) -> Result<bool> {
        self.with_retry("delete template", |conn| {
            Ok(conn.execute("DELETE FROM templates WHERE id = ?1", [id])? > 0)
        })
    }

    // =========================================================================
    // Local overrides
    // =========================================================================

    pub fn overrides(&self) -> Result<LocalOverrides> {
        self.with_retry("load overrides", |conn| {
            let mut stmt = conn.prepare("SELECT service_id, active FROM service_overrides")?;
            let service_active = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<BTreeMap<String, bool>>>()?;

            let mut stmt = conn.prepare("SELECT incident_id FROM pinned_incidents")?;
            let pinned_incidents = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<BTreeSet<String>>>()?;

            Ok(LocalOverrides {
                service_active,
                pinned_incidents,
            })
        })
    }

    pub fn put_service_active(&self, service_id: &str, active: bool) -> Result<()> {
        self.with_retry("save service override", |conn| {
            conn.execute(
                "INSERT INTO service_overrides (service_id, active) VALUES (?1, ?2)
                 ON CONFLICT(service_id) DO UPDATE SET active = excluded.active",
                params![service_id, active],
            )?;
            Ok(())
        })
    }

    pub fn put_pinned(&self, incident_id: &str, pinned: bool) -> Result<()> {
        let pinned_at = format_timestamp(&Utc::now());
        self.with_retry("save pin", |conn| {
            if pinned {
                conn.execute(
                    "INSERT OR IGNORE INTO pinned_incidents (incident_id, pinned_at) VALUES (?1, ?2)",
                    params![incident_id, pinned_at],
                )?;
            } else {
                conn.execute("DELETE FROM pinned_incidents WHERE incident_id = ?1", [incident_id])?;
            }
            Ok(())
        })
    }
}

/// Migration to version 1: settings, drafts and templates.
fn migration_v1(conn: &Connection) -> Result<()> {
    debug!("Running migration v1: initial schema");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS draft_notes (
            incident_id TEXT PRIMARY KEY,
            note_text TEXT NOT NULL DEFAULT '',
            why_triggered TEXT NOT NULL DEFAULT '',
            impact TEXT NOT NULL DEFAULT '',
            actions TEXT NOT NULL DEFAULT '',
            links TEXT NOT NULL DEFAULT '',
            last_updated TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS templates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            body_text TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}

/// Migration to version 2: local overrides.
fn migration_v2(conn: &Connection) -> Result<()> {
    debug!("Running migration v2: local overrides");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_overrides (
            service_id TEXT PRIMARY KEY,
            active INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pinned_incidents (
            incident_id TEXT PRIMARY KEY,
            pinned_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pagerops.db");
        {
            let db = CacheDatabase::open(&path).unwrap();
            assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
            db.insert_template("Ack", "Looking into it").unwrap();
        }
        let db = CacheDatabase::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(db.templates().unwrap().len(), 1);
    }

    #[test]
    fn test_settings_upsert() {
        let db = CacheDatabase::open_in_memory().unwrap();
        db.put_settings(&[("theme", "dark".into())]).unwrap();
        db.put_settings(&[("theme", "light".into())]).unwrap();
        assert_eq!(db.get_setting("theme").unwrap().as_deref(), Some("light"));
        assert_eq!(db.get_setting("missing").unwrap(), None);
        assert_eq!(db.setting_pairs().unwrap().len(), 1);
    }

    #[test]
    fn test_draft_timestamp_survives() {
        let db = CacheDatabase::open_in_memory().unwrap();
        let mut draft = DraftNote::empty("PINC1");
        draft.impact = "EU checkout".into();
        draft.last_updated = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        db.upsert_draft(&draft).unwrap();

        let loaded = db.drafts().unwrap();
        assert_eq!(loaded, vec![draft]);
        assert!(db.remove_draft("PINC1").unwrap());
        assert!(!db.remove_draft("PINC1").unwrap());
    }

    #[test]
    fn test_template_update_of_missing_row() {
        let db = CacheDatabase::open_in_memory().unwrap();
        let missing = Template {
            id: 42,
            title: "x".into(),
            body_text: "y".into(),
        };
        assert!(!db.update_template(&missing).unwrap());
        assert!(!db.remove_template(42).unwrap());
    }

    #[test]
    fn test_pin_is_idempotent() {
        let db = CacheDatabase::open_in_memory().unwrap();
        db.put_pinned("PINC1", true).unwrap();
        db.put_pinned("PINC1", true).unwrap();
        assert_eq!(db.overrides().unwrap().pinned_incidents.len(), 1);
        db.put_pinned("PINC1", false).unwrap();
        assert!(db.overrides().unwrap().is_empty());
    }
}
