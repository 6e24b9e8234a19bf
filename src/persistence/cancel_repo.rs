//! Cancellation requests observed by running drivers.

use std::sync::Arc;

use chrono::Utc;

use crate::{AppError, Result};

use super::db::Database;
use super::retry::RetryPolicy;
use super::to_db_time;

/// Repository wrapper around `SQLite` for cancellation requests.
#[derive(Clone)]
pub struct CancelRepo {
    db: Arc<Database>,
    retry: RetryPolicy,
}

impl CancelRepo {
    /// Create a new repository instance with the default retry policy.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_retry(db, RetryPolicy::default())
    }

    /// Create a new repository instance with an explicit retry policy.
    #[must_use]
    pub fn with_retry(db: Arc<Database>, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Record a cancellation request for a stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the insert fails.
    pub async fn request(&self, application_id: &str, stream_id: &str) -> Result<()> {
        let now = to_db_time(Utc::now());
        let now = now.as_str();
        let db = self.db.as_ref();
        self.retry
            .run("cancel.request", || async move {
                sqlx::query(
                    "INSERT INTO cancellation_request (stream_id, application_id, requested_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(stream_id) DO NOTHING",
                )
                .bind(stream_id)
                .bind(application_id)
                .bind(now)
                .execute(db)
                .await
                .map(|_| ())
                .map_err(AppError::from)
            })
            .await
    }

    /// Whether a cancellation has been requested for a stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn is_requested(&self, stream_id: &str) -> Result<bool> {
        let db = self.db.as_ref();
        let found: Option<(String,)> = self
            .retry
            .run("cancel.is_requested", || async move {
                sqlx::query_as("SELECT stream_id FROM cancellation_request WHERE stream_id = ?1")
                    .bind(stream_id)
                    .fetch_optional(db)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        Ok(found.is_some())
    }
}
