//! Collaborator seams used by the generation driver.
//!
//! The [`AgentRuntime`] and [`ExecutionEnvironment`] traits decouple session
//! orchestration from the services that actually produce output and host the
//! generated application. Both are object-safe and return boxed futures so
//! they can be shared as `Arc<dyn …>` across tasks.

pub mod codec;
pub mod http_agent;
pub mod http_environment;

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::models::transcript::TranscriptMessage;
use crate::Result;

pub use http_agent::HttpAgentRuntime;
pub use http_environment::HttpEnvironmentProvider;

/// Boxed future returned by collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One unit of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentOutput {
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
        #[serde(default)]
        input: Value,
    },
    /// A tool returned.
    ToolResult {
        /// Tool name.
        name: String,
        /// Tool output.
        #[serde(default)]
        output: Value,
    },
    /// The run ended normally.
    Finish {
        /// Final assistant message, if the agent sends one separately.
        #[serde(default)]
        message: Option<String>,
    },
}

/// Input for one agent run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Application being generated.
    pub application_id: String,
    /// Earlier transcript messages, oldest first.
    pub prior_conversation: Vec<TranscriptMessage>,
    /// The new user instruction.
    pub instruction: String,
    /// Endpoint of the environment's tool server.
    pub tool_endpoint: String,
}

/// A started agent run.
pub struct AgentRun {
    /// Ordered output; ends after `Finish` or on error.
    pub events: BoxStream<'static, Result<AgentOutput>>,
    /// Fired to ask the runtime to abort, when supported.
    pub abort: Option<CancellationToken>,
}

impl std::fmt::Debug for AgentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun")
            .field("abort", &self.abort.is_some())
            .finish_non_exhaustive()
    }
}

/// Execution environment acquired for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    /// Public preview URL of the generated application.
    pub preview_url: String,
    /// Endpoint the agent uses to run tools inside the environment.
    pub tool_endpoint: String,
    /// Opaque filesystem handle.
    #[serde(default)]
    pub filesystem: String,
}

/// Produces a stream of output for an instruction.
pub trait AgentRuntime: Send + Sync {
    /// Start a run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` if the run cannot be started.
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, AgentRun>;
}

/// Provides the sandbox the agent works in.
pub trait ExecutionEnvironment: Send + Sync {
    /// Acquire (or reuse) the environment for an application.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Environment` if no environment can be provided.
    fn request_environment<'a>(&'a self, application_id: &'a str)
        -> BoxFuture<'a, EnvironmentHandle>;
}
