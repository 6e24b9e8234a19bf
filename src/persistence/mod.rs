//! Persistence layer modules.

pub mod cancel_repo;
pub mod db;
pub mod hook_repo;
pub mod retention;
pub mod retry;
pub mod schema;
pub mod session_repo;
pub mod stream_repo;
pub mod transcript_repo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Fixed-width RFC 3339 form so stored timestamps compare lexicographically.
pub(crate) fn to_db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_time(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

pub(crate) fn from_db_time_opt(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| from_db_time(value, field)).transpose()
}
