//! Completion hook records: the one-time flag behind at-most-once hooks.
//!
//! A record is written `pending` in the same transaction that moves a session
//! to `completed`. A runner must win [`HookRepo::claim`] before running any
//! hook; the claim is a conditional update, so it succeeds once per stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::models::hook::{CompletionRecord, HookStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::retry::RetryPolicy;
use super::{from_db_time, from_db_time_opt, to_db_time};

/// Repository wrapper around `SQLite` for completion hook records.
#[derive(Clone)]
pub struct HookRepo {
    db: Arc<Database>,
    retry: RetryPolicy,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct HookRow {
    stream_id: String,
    application_id: String,
    preview_url: Option<String>,
    notify_to: Option<String>,
    summary: Option<String>,
    status: String,
    created_at: String,
    claimed_at: Option<String>,
}

impl HookRow {
    fn into_record(self) -> Result<CompletionRecord> {
        let status = match self.status.as_str() {
            "pending" => HookStatus::Pending,
            "claimed" => HookStatus::Claimed,
            other => return Err(AppError::Db(format!("invalid hook status: {other}"))),
        };
        Ok(CompletionRecord {
            stream_id: self.stream_id,
            application_id: self.application_id,
            preview_url: self.preview_url,
            notify_to: self.notify_to,
            summary: self.summary,
            status,
            created_at: from_db_time(&self.created_at, "created_at")?,
            claimed_at: from_db_time_opt(self.claimed_at.as_deref(), "claimed_at")?,
        })
    }
}

/// Insert a pending record on an open connection or transaction.
pub(crate) async fn insert_pending(
    conn: &mut SqliteConnection,
    record: &CompletionRecord,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO completion_hook (stream_id, application_id, preview_url, notify_to,
         summary, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
         ON CONFLICT(stream_id) DO NOTHING",
    )
    .bind(&record.stream_id)
    .bind(&record.application_id)
    .bind(&record.preview_url)
    .bind(&record.notify_to)
    .bind(&record.summary)
    .bind(to_db_time(record.created_at))
    .execute(conn)
    .await?;
    Ok(())
}

impl HookRepo {
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

    /// Retrieve the record for a stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn get(&self, stream_id: &str) -> Result<Option<CompletionRecord>> {
        let db = self.db.as_ref();
        let row: Option<HookRow> = self
            .retry
            .run("hook.get", || async move {
                sqlx::query_as("SELECT * FROM completion_hook WHERE stream_id = ?1")
                    .bind(stream_id)
                    .fetch_optional(db)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        row.map(HookRow::into_record).transpose()
    }

    /// Take ownership of a pending record.
    ///
    /// Returns the claimed record, or `None` if it was already claimed or
    /// never existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the update fails.
    pub async fn claim(&self, stream_id: &str) -> Result<Option<CompletionRecord>> {
        let now = to_db_time(Utc::now());
        let now = now.as_str();
        let db = self.db.as_ref();
        let affected = self
            .retry
            .run("hook.claim", || async move {
                sqlx::query(
                    "UPDATE completion_hook SET status = 'claimed', claimed_at = ?1
                     WHERE stream_id = ?2 AND status = 'pending'",
                )
                .bind(now)
                .bind(stream_id)
                .execute(db)
                .await
                .map(|done| done.rows_affected())
                .map_err(AppError::from)
            })
            .await?;

        if affected == 1 {
            self.get(stream_id).await
        } else {
            Ok(None)
        }
    }

    /// List pending records created before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn list_pending_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompletionRecord>> {
        let cutoff = to_db_time(cutoff);
        let cutoff = cutoff.as_str();
        let db = self.db.as_ref();
        let rows: Vec<HookRow> = self
            .retry
            .run("hook.list_pending", || async move {
                sqlx::query_as(
                    "SELECT * FROM completion_hook
                     WHERE status = 'pending' AND created_at < ?1
                     ORDER BY created_at",
                )
                .bind(cutoff)
                .fetch_all(db)
                .await
                .map_err(AppError::from)
            })
            .await?;

        rows.into_iter().map(HookRow::into_record).collect()
    }
}
