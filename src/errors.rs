//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure that is not worth retrying.
    Db(String),
    /// Store stayed unreachable after bounded retries; the caller may retry.
    Unavailable(String),
    /// Another generation for the application is active and did not stop in time.
    Busy(String),
    /// A conditional write found the session replaced by a newer attempt.
    Superseded(String),
    /// Publish attempted on a frozen or unknown stream buffer.
    StreamClosed(String),
    /// Agent runtime failure or malformed agent output.
    Agent(String),
    /// Execution environment could not be acquired.
    Environment(String),
    /// Notification delivery failure.
    Notify(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller supplied an invalid request.
    BadRequest(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the caller should retry the same request after a short delay.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Unavailable(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Self::Busy(msg) => write!(f, "busy: {msg}"),
            Self::Superseded(msg) => write!(f, "superseded: {msg}"),
            Self::StreamClosed(msg) => write!(f, "stream closed: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Environment(msg) => write!(f, "environment: {msg}"),
            Self::Notify(msg) => write!(f, "notify: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            Self::Unavailable(err.to_string())
        } else {
            Self::Db(err.to_string())
        }
    }
}

/// `SQLITE_BUSY` and `SQLITE_LOCKED` primary result codes.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Classify store errors that a later attempt can plausibly succeed on.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("json: {err}"))
    }
}
