//! Stream buffers and their sequenced events.
//!
//! Sequence numbers are assigned inside a single `INSERT … SELECT` statement,
//! so concurrent appends to one stream serialize on the `SQLite` write lock and
//! can never reuse a number. The same statement refuses to append once the
//! buffer is frozen.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::event::{StreamEvent, StreamEventKind};
use crate::{AppError, Result};

use super::db::Database;
use super::retry::RetryPolicy;
use super::{from_db_time, from_db_time_opt, to_db_time};

/// Metadata of one stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    /// Stream identifier.
    pub stream_id: String,
    /// Owning application.
    pub application_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When the terminal marker was written.
    pub closed_at: Option<DateTime<Utc>>,
    /// When the buffer becomes collectable.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BufferInfo {
    /// Whether the buffer is frozen.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// Whether the buffer is past its grace period at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Repository wrapper around `SQLite` for stream buffers.
#[derive(Clone)]
pub struct StreamRepo {
    db: Arc<Database>,
    retry: RetryPolicy,
}

#[derive(sqlx::FromRow)]
struct BufferRow {
    stream_id: String,
    application_id: String,
    created_at: String,
    closed_at: Option<String>,
    expires_at: Option<String>,
}

impl BufferRow {
    fn into_info(self) -> Result<BufferInfo> {
        Ok(BufferInfo {
            stream_id: self.stream_id,
            application_id: self.application_id,
            created_at: from_db_time(&self.created_at, "created_at")?,
            closed_at: from_db_time_opt(self.closed_at.as_deref(), "closed_at")?,
            expires_at: from_db_time_opt(self.expires_at.as_deref(), "expires_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    stream_id: String,
    sequence: i64,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<StreamEvent> {
        let kind: StreamEventKind = serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Db(format!("invalid event payload: {e}")))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| AppError::Db(format!("negative sequence: {}", self.sequence)))?;
        Ok(StreamEvent {
            stream_id: self.stream_id,
            sequence,
            kind,
            created_at: from_db_time(&self.created_at, "created_at")?,
        })
    }
}

const APPEND: &str = "INSERT INTO stream_event (stream_id, sequence, kind, payload, created_at)
     SELECT ?1,
            COALESCE((SELECT MAX(sequence) FROM stream_event WHERE stream_id = ?1), -1) + 1,
            ?2, ?3, ?4
     WHERE EXISTS (SELECT 1 FROM stream_buffer WHERE stream_id = ?1 AND closed_at IS NULL)
     RETURNING sequence";

fn to_db_sequence(sequence: u64) -> Result<i64> {
    i64::try_from(sequence).map_err(|_| AppError::BadRequest(format!("sequence {sequence} out of range")))
}

impl StreamRepo {
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

    /// Create an empty, open buffer. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the insert fails.
    pub async fn open(&self, stream_id: &str, application_id: &str) -> Result<()> {
        let now = to_db_time(Utc::now());
        let now = now.as_str();
        let db = self.db.as_ref();
        self.retry
            .run("stream.open", || async move {
                sqlx::query(
                    "INSERT INTO stream_buffer (stream_id, application_id, created_at)
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

    /// Append an event with the next sequence number.
    ///
    /// Returns `None` if the buffer is frozen or unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the insert fails.
    pub async fn append(
        &self,
        stream_id: &str,
        kind: &StreamEventKind,
    ) -> Result<Option<StreamEvent>> {
        let payload = serde_json::to_string(kind)?;
        let created_at = Utc::now();
        let created = to_db_time(created_at);
        let (payload_ref, created_ref, name) = (payload.as_str(), created.as_str(), kind.name());
        let db = self.db.as_ref();
        let sequence: Option<(i64,)> = self
            .retry
            .run("stream.append", || async move {
                sqlx::query_as(APPEND)
                    .bind(stream_id)
                    .bind(name)
                    .bind(payload_ref)
                    .bind(created_ref)
                    .fetch_optional(db)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        sequence
            .map(|(seq,)| {
                Ok(StreamEvent {
                    stream_id: stream_id.to_owned(),
                    sequence: u64::try_from(seq)
                        .map_err(|_| AppError::Db(format!("negative sequence: {seq}")))?,
                    kind: kind.clone(),
                    created_at,
                })
            })
            .transpose()
    }

    /// Append the terminal marker and freeze the buffer in one transaction.
    ///
    /// Returns `None` if the buffer was already frozen or unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the write fails.
    pub async fn close(
        &self,
        stream_id: &str,
        kind: &StreamEventKind,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<StreamEvent>> {
        let payload = serde_json::to_string(kind)?;
        let created_at = Utc::now();
        let created = to_db_time(created_at);
        let expires = to_db_time(expires_at);
        let (payload_ref, created_ref, expires_ref, name) =
            (payload.as_str(), created.as_str(), expires.as_str(), kind.name());
        let db = self.db.as_ref();
        let sequence: Option<i64> = self
            .retry
            .run("stream.close", || async move {
                let mut tx = db.begin().await?;
                let row: Option<(i64,)> = sqlx::query_as(APPEND)
                    .bind(stream_id)
                    .bind(name)
                    .bind(payload_ref)
                    .bind(created_ref)
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some((seq,)) = row else {
                    tx.rollback().await?;
                    return Ok::<_, AppError>(None);
                };
                sqlx::query(
                    "UPDATE stream_buffer SET closed_at = ?1, expires_at = ?2
                     WHERE stream_id = ?3 AND closed_at IS NULL",
                )
                .bind(created_ref)
                .bind(expires_ref)
                .bind(stream_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok::<_, AppError>(Some(seq))
            })
            .await?;

        sequence
            .map(|seq| {
                Ok(StreamEvent {
                    stream_id: stream_id.to_owned(),
                    sequence: u64::try_from(seq)
                        .map_err(|_| AppError::Db(format!("negative sequence: {seq}")))?,
                    kind: kind.clone(),
                    created_at,
                })
            })
            .transpose()
    }

    /// Retrieve buffer metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn buffer(&self, stream_id: &str) -> Result<Option<BufferInfo>> {
        let db = self.db.as_ref();
        let row: Option<BufferRow> = self
            .retry
            .run("stream.buffer", || async move {
                sqlx::query_as(
                    "SELECT stream_id, application_id, created_at, closed_at, expires_at
                     FROM stream_buffer WHERE stream_id = ?1",
                )
                .bind(stream_id)
                .fetch_optional(db)
                .await
                .map_err(AppError::from)
            })
            .await?;

        row.map(BufferRow::into_info).transpose()
    }

    /// Read up to `limit` events with `sequence >= from`, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn read_from(&self, stream_id: &str, from: u64, limit: u32) -> Result<Vec<StreamEvent>> {
        let from = to_db_sequence(from)?;
        let db = self.db.as_ref();
        let rows: Vec<EventRow> = self
            .retry
            .run("stream.read_from", || async move {
                sqlx::query_as(
                    "SELECT stream_id, sequence, payload, created_at FROM stream_event
                     WHERE stream_id = ?1 AND sequence >= ?2
                     ORDER BY sequence LIMIT ?3",
                )
                .bind(stream_id)
                .bind(from)
                .bind(i64::from(limit))
                .fetch_all(db)
                .await
                .map_err(AppError::from)
            })
            .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// Sequence number the next appended event will receive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn next_sequence(&self, stream_id: &str) -> Result<u64> {
        let db = self.db.as_ref();
        let (next,): (i64,) = self
            .retry
            .run("stream.next_sequence", || async move {
                sqlx::query_as(
                    "SELECT COALESCE(MAX(sequence), -1) + 1 FROM stream_event WHERE stream_id = ?1",
                )
                .bind(stream_id)
                .fetch_one(db)
                .await
                .map_err(AppError::from)
            })
            .await?;

        u64::try_from(next).map_err(|_| AppError::Db(format!("negative sequence: {next}")))
    }

    /// Delete buffers (and their events and cancellation requests) whose
    /// grace period ended before `now`.
    ///
    /// Returns the number of buffers removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the delete fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let now = to_db_time(now);
        let now = now.as_str();
        let db = self.db.as_ref();
        self.retry
            .run("stream.purge_expired", || async move {
                let mut tx = db.begin().await?;
                // Children first, while the buffer rows still identify them.
                for table in ["stream_event", "cancellation_request"] {
                    // `table` comes from the literal list above, never from input.
                    let query = format!(
                        "DELETE FROM {table} WHERE stream_id IN
                         (SELECT stream_id FROM stream_buffer
                          WHERE expires_at IS NOT NULL AND expires_at <= ?1)"
                    );
                    sqlx::query(&query).bind(now).execute(&mut *tx).await?;
                }
                let done = sqlx::query(
                    "DELETE FROM stream_buffer WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                )
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok::<_, AppError>(done.rows_affected())
            })
            .await
    }
}
