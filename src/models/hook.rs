//! One-time completion hook record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claim status of a completion hook record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    /// Written with the Completed transition; hooks not yet run.
    Pending,
    /// A runner took ownership; hooks never fire again.
    Claimed,
}

/// Context handed to completion hooks, keyed by stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionRecord {
    /// Completed generation attempt.
    pub stream_id: String,
    /// Owning application.
    pub application_id: String,
    /// Preview URL from the execution environment.
    pub preview_url: Option<String>,
    /// Notification recipient.
    pub notify_to: Option<String>,
    /// Final assistant message.
    pub summary: Option<String>,
    /// Claim status.
    pub status: HookStatus,
    /// Record creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When a runner claimed the record.
    pub claimed_at: Option<DateTime<Utc>>,
}
