//! # pagerops-db
//!
//! SQLite persistence for the parts of PagerOps that are owned locally:
//! settings, draft notes, note templates and local overrides (service
//! `active` flags and incident pins).
//!
//! [`CacheDatabase`] implements every persistence trait of
//! `pagerops-cache`.

pub mod db;
pub mod error;
mod stores;

pub use db::CacheDatabase;
pub use error::{DbError, Result};
