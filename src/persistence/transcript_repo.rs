//! Append-only conversation transcript per application.

use std::sync::Arc;

use sqlx::SqliteConnection;

use crate::models::transcript::{Role, TranscriptMessage};
use crate::{AppError, Result};

use super::db::Database;
use super::retry::RetryPolicy;
use super::{from_db_time, to_db_time};

/// Repository wrapper around `SQLite` for transcript messages.
#[derive(Clone)]
pub struct TranscriptRepo {
    db: Arc<Database>,
    retry: RetryPolicy,
}

#[derive(sqlx::FromRow)]
struct TranscriptRow {
    id: String,
    application_id: String,
    stream_id: Option<String>,
    role: String,
    content: String,
    created_at: String,
}

impl TranscriptRow {
    fn into_message(self) -> Result<TranscriptMessage> {
        let role = match self.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => return Err(AppError::Db(format!("invalid transcript role: {other}"))),
        };
        Ok(TranscriptMessage {
            id: self.id,
            application_id: self.application_id,
            stream_id: self.stream_id,
            role,
            content: self.content,
            created_at: from_db_time(&self.created_at, "created_at")?,
        })
    }
}

/// Insert a message on an open connection or transaction.
pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    message: &TranscriptMessage,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO transcript_message (id, application_id, stream_id, role,
         content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(&message.application_id)
    .bind(&message.stream_id)
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(to_db_time(message.created_at))
    .execute(conn)
    .await?;
    Ok(())
}

impl TranscriptRepo {
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

    /// Append a message. Idempotent on the message id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the insert fails.
    pub async fn append(&self, message: &TranscriptMessage) -> Result<()> {
        let db = self.db.as_ref();
        self.retry
            .run("transcript.append", || async move {
                let mut conn = db.acquire().await?;
                insert_message(&mut conn, message).await
            })
            .await
    }

    /// All messages of an application in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn list(&self, application_id: &str) -> Result<Vec<TranscriptMessage>> {
        let db = self.db.as_ref();
        let rows: Vec<TranscriptRow> = self
            .retry
            .run("transcript.list", || async move {
                sqlx::query_as(
                    "SELECT id, application_id, stream_id, role, content, created_at
                     FROM transcript_message WHERE application_id = ?1
                     ORDER BY created_at, rowid",
                )
                .bind(application_id)
                .fetch_all(db)
                .await
                .map_err(AppError::from)
            })
            .await?;

        rows.into_iter().map(TranscriptRow::into_message).collect()
    }
}
