//! Session store: one record per application, mutated only by conditional
//! writes.
//!
//! Every mutation except [`SessionRepo::delete`] is guarded by the
//! `(application_id, stream_id, version)` triple the caller last observed.
//! A write that matches no row means another node got there first; the caller
//! sees `None` / `false` and decides what that means.

use std::sync::Arc;

use chrono::Utc;

use crate::models::hook::{CompletionRecord, HookStatus};
use crate::models::session::{EndReason, Session, SessionState};
use crate::models::transcript::{Role, TranscriptMessage};
use crate::{AppError, Result};

use super::db::Database;
use super::retry::RetryPolicy;
use super::{from_db_time, from_db_time_opt, hook_repo, to_db_time, transcript_repo};

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
    retry: RetryPolicy,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    application_id: String,
    stream_id: String,
    state: String,
    version: i64,
    instruction: String,
    notify_to: Option<String>,
    preview_url: Option<String>,
    started_at: String,
    last_heartbeat_at: String,
    cancel_requested_at: Option<String>,
    end_reason: Option<String>,
    failure_cause: Option<String>,
    ended_at: Option<String>,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let state = SessionState::parse(&self.state)
            .ok_or_else(|| AppError::Db(format!("invalid session state: {}", self.state)))?;
        let end_reason = self
            .end_reason
            .as_deref()
            .map(|raw| {
                EndReason::parse(raw)
                    .ok_or_else(|| AppError::Db(format!("invalid end reason: {raw}")))
            })
            .transpose()?;

        Ok(Session {
            application_id: self.application_id,
            stream_id: self.stream_id,
            state,
            version: self.version,
            instruction: self.instruction,
            notify_to: self.notify_to,
            preview_url: self.preview_url,
            started_at: from_db_time(&self.started_at, "started_at")?,
            last_heartbeat_at: from_db_time(&self.last_heartbeat_at, "last_heartbeat_at")?,
            cancel_requested_at: from_db_time_opt(
                self.cancel_requested_at.as_deref(),
                "cancel_requested_at",
            )?,
            end_reason,
            failure_cause: self.failure_cause,
            ended_at: from_db_time_opt(self.ended_at.as_deref(), "ended_at")?,
        })
    }
}

/// Owned bind values for a full session row.
struct SessionBinds {
    application_id: String,
    stream_id: String,
    state: &'static str,
    version: i64,
    instruction: String,
    notify_to: Option<String>,
    preview_url: Option<String>,
    started_at: String,
    last_heartbeat_at: String,
    cancel_requested_at: Option<String>,
    end_reason: Option<&'static str>,
    failure_cause: Option<String>,
    ended_at: Option<String>,
}

impl SessionBinds {
    fn new(session: &Session, version: i64) -> Self {
        Self {
            application_id: session.application_id.clone(),
            stream_id: session.stream_id.clone(),
            state: session.state.as_str(),
            version,
            instruction: session.instruction.clone(),
            notify_to: session.notify_to.clone(),
            preview_url: session.preview_url.clone(),
            started_at: to_db_time(session.started_at),
            last_heartbeat_at: to_db_time(session.last_heartbeat_at),
            cancel_requested_at: session.cancel_requested_at.map(to_db_time),
            end_reason: session.end_reason.map(EndReason::as_str),
            failure_cause: session.failure_cause.clone(),
            ended_at: session.ended_at.map(to_db_time),
        }
    }
}

const UPDATE_GUARDED: &str = "UPDATE session SET stream_id = ?1, state = ?2, version = ?3,
     instruction = ?4, notify_to = ?5, preview_url = ?6, started_at = ?7,
     last_heartbeat_at = ?8, cancel_requested_at = ?9, end_reason = ?10,
     failure_cause = ?11, ended_at = ?12
     WHERE application_id = ?13 AND stream_id = ?14 AND version = ?15";

/// Check that `next` is a legal successor of `observed`.
fn check_successor(observed: &Session, next: &Session) -> Result<()> {
    let permitted = if observed.stream_id == next.stream_id {
        observed.state == next.state || observed.can_transition_to(next.state)
    } else {
        observed.state.is_terminal() && next.state == SessionState::Starting
    };
    if permitted {
        Ok(())
    } else {
        Err(AppError::Db(format!(
            "invalid session transition {} -> {}",
            observed.state.as_str(),
            next.state.as_str()
        )))
    }
}

impl SessionRepo {
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

    /// Retrieve the session record of an application.
    ///
    /// Returns `Ok(None)` if the application has no record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the query fails.
    pub async fn get(&self, application_id: &str) -> Result<Option<Session>> {
        let db = self.db.as_ref();
        let row: Option<SessionRow> = self
            .retry
            .run("session.get", || async move {
                sqlx::query_as("SELECT * FROM session WHERE application_id = ?1")
                    .bind(application_id)
                    .fetch_optional(db)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Insert a record for an application that has none.
    ///
    /// Returns `false` if a record already exists; the existing record is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the insert fails.
    pub async fn insert(&self, session: &Session) -> Result<bool> {
        let binds = SessionBinds::new(session, session.version);
        let b = &binds;
        let db = self.db.as_ref();
        let affected = self
            .retry
            .run("session.insert", || async move {
                sqlx::query(
                    "INSERT INTO session (stream_id, state, version, instruction, notify_to,
                     preview_url, started_at, last_heartbeat_at, cancel_requested_at,
                     end_reason, failure_cause, ended_at, application_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(application_id) DO NOTHING",
                )
                .bind(&b.stream_id)
                .bind(b.state)
                .bind(b.version)
                .bind(&b.instruction)
                .bind(&b.notify_to)
                .bind(&b.preview_url)
                .bind(&b.started_at)
                .bind(&b.last_heartbeat_at)
                .bind(&b.cancel_requested_at)
                .bind(b.end_reason)
                .bind(&b.failure_cause)
                .bind(&b.ended_at)
                .bind(&b.application_id)
                .execute(db)
                .await
                .map(|done| done.rows_affected())
                .map_err(AppError::from)
            })
            .await?;

        Ok(affected == 1)
    }

    /// Replace `observed` with `next` if nobody changed the record since it
    /// was read.
    ///
    /// Returns the stored record (with its bumped version) on success, or
    /// `None` if the guard did not match.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an illegal transition or a failed write,
    /// `AppError::Unavailable` if the store stays unreachable.
    pub async fn compare_and_swap(
        &self,
        observed: &Session,
        next: &Session,
    ) -> Result<Option<Session>> {
        check_successor(observed, next)?;
        let binds = SessionBinds::new(next, observed.version + 1);
        let b = &binds;
        let db = self.db.as_ref();
        let affected = self
            .retry
            .run("session.compare_and_swap", || async move {
                bind_guarded(sqlx::query(UPDATE_GUARDED), b, observed)
                    .execute(db)
                    .await
                    .map(|done| done.rows_affected())
                    .map_err(AppError::from)
            })
            .await?;

        Ok((affected == 1).then(|| Session {
            version: binds.version,
            ..next.clone()
        }))
    }

    /// Move `observed` to a normally completed `next` and write the one-time
    /// completion hook record in the same transaction. A `summary` is also
    /// appended to the transcript as the assistant's reply, in that same
    /// transaction.
    ///
    /// Returns `None` (and writes nothing) if the guard did not match.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` for an illegal transition or a failed write,
    /// `AppError::Unavailable` if the store stays unreachable.
    pub async fn complete_with_hook(
        &self,
        observed: &Session,
        next: &Session,
        summary: Option<&str>,
    ) -> Result<Option<Session>> {
        check_successor(observed, next)?;
        let binds = SessionBinds::new(next, observed.version + 1);
        let record = CompletionRecord {
            stream_id: next.stream_id.clone(),
            application_id: next.application_id.clone(),
            preview_url: next.preview_url.clone(),
            notify_to: next.notify_to.clone(),
            summary: summary.map(str::to_owned),
            status: HookStatus::Pending,
            created_at: Utc::now(),
            claimed_at: None,
        };
        let reply = summary.map(|text| {
            TranscriptMessage::new(
                next.application_id.clone(),
                Some(next.stream_id.clone()),
                Role::Assistant,
                text.to_owned(),
            )
        });
        let (b, rec, reply) = (&binds, &record, reply.as_ref());
        let db = self.db.as_ref();
        let applied = self
            .retry
            .run("session.complete_with_hook", || async move {
                let mut tx = db.begin().await?;
                let done = bind_guarded(sqlx::query(UPDATE_GUARDED), b, observed)
                    .execute(&mut *tx)
                    .await?;
                if done.rows_affected() != 1 {
                    tx.rollback().await?;
                    return Ok::<_, AppError>(false);
                }
                hook_repo::insert_pending(&mut *tx, rec).await?;
                if let Some(reply) = reply {
                    transcript_repo::insert_message(&mut *tx, reply).await?;
                }
                tx.commit().await?;
                Ok::<_, AppError>(true)
            })
            .await?;

        Ok(applied.then(|| Session {
            version: binds.version,
            ..next.clone()
        }))
    }

    /// Refresh the heartbeat of a still-active attempt.
    ///
    /// Does not bump the version. Returns `false` if the record no longer
    /// belongs to `stream_id` or is no longer active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the update fails.
    pub async fn touch_heartbeat(&self, application_id: &str, stream_id: &str) -> Result<bool> {
        let now = to_db_time(Utc::now());
        let now = now.as_str();
        let db = self.db.as_ref();
        let affected = self
            .retry
            .run("session.touch_heartbeat", || async move {
                sqlx::query(
                    "UPDATE session SET last_heartbeat_at = ?1
                     WHERE application_id = ?2 AND stream_id = ?3
                     AND state IN ('starting', 'running', 'stopping')",
                )
                .bind(now)
                .bind(application_id)
                .bind(stream_id)
                .execute(db)
                .await
                .map(|done| done.rows_affected())
                .map_err(AppError::from)
            })
            .await?;

        Ok(affected == 1)
    }

    /// Unconditionally remove the record of an application.
    ///
    /// Returns `true` if a record was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` or `AppError::Unavailable` if the delete fails.
    pub async fn delete(&self, application_id: &str) -> Result<bool> {
        let db = self.db.as_ref();
        let affected = self
            .retry
            .run("session.delete", || async move {
                sqlx::query("DELETE FROM session WHERE application_id = ?1")
                    .bind(application_id)
                    .execute(db)
                    .await
                    .map(|done| done.rows_affected())
                    .map_err(AppError::from)
            })
            .await?;

        Ok(affected == 1)
    }
}

fn bind_guarded<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    b: &'q SessionBinds,
    observed: &'q Session,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&b.stream_id)
        .bind(b.state)
        .bind(b.version)
        .bind(&b.instruction)
        .bind(&b.notify_to)
        .bind(&b.preview_url)
        .bind(&b.started_at)
        .bind(&b.last_heartbeat_at)
        .bind(&b.cancel_requested_at)
        .bind(b.end_reason)
        .bind(&b.failure_cause)
        .bind(&b.ended_at)
        .bind(&b.application_id)
        .bind(&observed.stream_id)
        .bind(observed.version)
}
