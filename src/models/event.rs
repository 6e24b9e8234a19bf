//! Stream events relayed from the agent to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::EndReason;

/// Payload of one stream event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    /// Incremental assistant text.
    TextDelta {
        /// Appended text.
        text: String,
    },
    /// The agent invoked a tool.
    ToolCall {
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        name: String,
        /// Tool output.
        output: Value,
    },
    /// Driver-side progress information.
    Status {
        /// Human-readable message.
        message: String,
    },
    /// Terminal marker; nothing follows it.
    Finish {
        /// Why the stream ended.
        reason: EndReason,
        /// Final assistant message, for completed streams.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Failure cause, for failed streams.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl StreamEventKind {
    /// Whether this is the terminal marker.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }

    /// Short name used for the SSE `event:` field and the store column.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Status { .. } => "status",
            Self::Finish { .. } => "finish",
        }
    }

    /// Terminal marker for a cancelled stream.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::Finish {
            reason: EndReason::Cancelled,
            message: None,
            cause: None,
        }
    }

    /// Terminal marker for a failed stream.
    #[must_use]
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Finish {
            reason: EndReason::Failed,
            message: None,
            cause: Some(cause.into()),
        }
    }
}

/// One sequenced event of a stream buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Position in the stream, starting at 0.
    pub sequence: u64,
    /// Event payload.
    #[serde(flatten)]
    pub kind: StreamEventKind,
    /// Publish timestamp.
    pub created_at: DateTime<Utc>,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Replay from this sequence (inclusive).
    Sequence(u64),
    /// Only events published after subscribing.
    Tail,
}

impl Default for StartAt {
    fn default() -> Self {
        Self::Sequence(0)
    }
}
