//! Caller-visible conversation transcript.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The requesting user.
    User,
    /// The generating agent.
    Assistant,
}

impl Role {
    /// Stable string form used in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Append-only transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptMessage {
    /// Unique record identifier.
    pub id: String,
    /// Application the conversation belongs to.
    pub application_id: String,
    /// Generation attempt that produced or consumed the message.
    pub stream_id: Option<String>,
    /// Author.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Append timestamp.
    pub created_at: DateTime<Utc>,
}

impl TranscriptMessage {
    /// Construct a new transcript entry with a generated identifier.
    #[must_use]
    pub fn new(
        application_id: String,
        stream_id: Option<String>,
        role: Role,
        content: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            application_id,
            stream_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }
}
