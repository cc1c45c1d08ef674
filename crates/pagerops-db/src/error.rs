//! Error types for the SQLite layer.

use pagerops_core::PagerOpsError;
use thiserror::Error;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error while preparing the database location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema migration failed
    #[error("migration error: {0}")]
    Migration(String),

    /// The connection mutex was poisoned by a panicking writer
    #[error("connection lock poisoned: {0}")]
    LockPoisoned(String),

    /// A stored value could not be decoded
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
}

impl DbError {
    /// Check if this error indicates a busy or locked database.
    pub fn is_database_locked(&self) -> bool {
        match self {
            DbError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
            }
            _ => false,
        }
    }

    /// Convert into the engine-wide error, naming the failed operation.
    pub fn into_persistence(self, operation: &str) -> PagerOpsError {
        PagerOpsError::persistence(operation, self.to_string())
    }
}

impl From<DbError> for PagerOpsError {
    fn from(error: DbError) -> Self {
        error.into_persistence("database")
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;
