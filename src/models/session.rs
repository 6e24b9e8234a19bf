//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state for a generation session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No generation has been requested yet.
    Idle,
    /// Admitted; the driver is acquiring its collaborators.
    Starting,
    /// The agent is producing output.
    Running,
    /// Cancellation requested; waiting for the driver to observe it.
    Stopping,
    /// Finished normally or by cancellation.
    Completed,
    /// Finished with a collaborator error.
    Failed,
}

impl SessionState {
    /// Whether no further events or transitions follow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state blocks admission of a new session.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Stable string form used in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Why a session reached a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The agent finished its work.
    Completed,
    /// A stop was requested and honored.
    Cancelled,
    /// A collaborator failed.
    Failed,
}

impl EndReason {
    /// Stable string form used in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored string form.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Session record persisted in the session store, one per application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Owning application; unique key of the record.
    pub application_id: String,
    /// Opaque token for this generation attempt.
    pub stream_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Optimistic concurrency counter, bumped on every state mutation.
    pub version: i64,
    /// Natural-language instruction that started the attempt.
    pub instruction: String,
    /// Recipient for the completion notification, if any.
    pub notify_to: Option<String>,
    /// Preview URL reported by the execution environment.
    pub preview_url: Option<String>,
    /// Admission timestamp.
    pub started_at: DateTime<Utc>,
    /// Last checkpoint reached by the driver.
    pub last_heartbeat_at: DateTime<Utc>,
    /// When a stop was first requested.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Terminal reason, once terminal.
    pub end_reason: Option<EndReason>,
    /// Recorded collaborator error for failed sessions.
    pub failure_cause: Option<String>,
    /// Terminal timestamp.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a freshly admitted session with a new stream identifier.
    #[must_use]
    pub fn starting(application_id: String, instruction: String, notify_to: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            application_id,
            stream_id: Uuid::new_v4().to_string(),
            state: SessionState::Starting,
            version: 0,
            instruction,
            notify_to,
            preview_url: None,
            started_at: now,
            last_heartbeat_at: now,
            cancel_requested_at: None,
            end_reason: None,
            failure_cause: None,
            ended_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self.state, next),
            (SessionState::Idle, SessionState::Starting)
                | (
                    SessionState::Starting,
                    SessionState::Running
                        | SessionState::Stopping
                        | SessionState::Completed
                        | SessionState::Failed
                )
                | (
                    SessionState::Running,
                    SessionState::Stopping | SessionState::Completed | SessionState::Failed
                )
                | (
                    SessionState::Stopping,
                    SessionState::Completed | SessionState::Failed
                )
        )
    }

    /// Copy of this record in a terminal state with the given reason.
    #[must_use]
    pub fn finished(&self, reason: EndReason, cause: Option<String>) -> Self {
        let state = if reason == EndReason::Failed {
            SessionState::Failed
        } else {
            SessionState::Completed
        };
        let now = Utc::now();
        Self {
            state,
            end_reason: Some(reason),
            failure_cause: cause,
            ended_at: Some(now),
            last_heartbeat_at: now,
            ..self.clone()
        }
    }
}
