//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so the bootstrap
//! re-runs on every node startup and converges.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    application_id      TEXT PRIMARY KEY NOT NULL,
    stream_id           TEXT NOT NULL,
    state               TEXT NOT NULL CHECK(state IN ('idle','starting','running','stopping','completed','failed')),
    version             INTEGER NOT NULL DEFAULT 0,
    instruction         TEXT NOT NULL,
    notify_to           TEXT,
    preview_url         TEXT,
    started_at          TEXT NOT NULL,
    last_heartbeat_at   TEXT NOT NULL,
    cancel_requested_at TEXT,
    end_reason          TEXT CHECK(end_reason IS NULL OR end_reason IN ('completed','cancelled','failed')),
    failure_cause       TEXT,
    ended_at            TEXT
);

CREATE TABLE IF NOT EXISTS stream_buffer (
    stream_id       TEXT PRIMARY KEY NOT NULL,
    application_id  TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    closed_at       TEXT,
    expires_at      TEXT
);

CREATE TABLE IF NOT EXISTS stream_event (
    stream_id       TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    kind            TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (stream_id, sequence)
);

CREATE TABLE IF NOT EXISTS cancellation_request (
    stream_id       TEXT PRIMARY KEY NOT NULL,
    application_id  TEXT NOT NULL,
    requested_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS completion_hook (
    stream_id       TEXT PRIMARY KEY NOT NULL,
    application_id  TEXT NOT NULL,
    preview_url     TEXT,
    notify_to       TEXT,
    summary         TEXT,
    status          TEXT NOT NULL CHECK(status IN ('pending','claimed')),
    created_at      TEXT NOT NULL,
    claimed_at      TEXT
);

CREATE TABLE IF NOT EXISTS transcript_message (
    id              TEXT PRIMARY KEY NOT NULL,
    application_id  TEXT NOT NULL,
    stream_id       TEXT,
    role            TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_buffer_expiry ON stream_buffer(expires_at);
CREATE INDEX IF NOT EXISTS idx_buffer_app ON stream_buffer(application_id);
CREATE INDEX IF NOT EXISTS idx_hook_status ON completion_hook(status);
CREATE INDEX IF NOT EXISTS idx_transcript_app ON transcript_message(application_id, created_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
