//! Agent runtime reached over HTTP.
//!
//! `POST {endpoint}/runs` starts a run; the response body is NDJSON, one
//! [`AgentOutput`] per line, read through [`NdjsonCodec`].

use futures_util::{StreamExt, TryStreamExt};
use serde::Serialize;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::models::transcript::Role;
use crate::{AppError, Result};

use super::codec::{parse_output_line, NdjsonCodec};
use super::{AgentRequest, AgentRun, AgentRuntime, BoxFuture};

/// HTTP client for the agent runtime service.
#[derive(Clone)]
pub struct HttpAgentRuntime {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct RunBody<'a> {
    application_id: &'a str,
    instruction: &'a str,
    tool_endpoint: &'a str,
    prior_conversation: Vec<PriorMessage<'a>>,
}

#[derive(Serialize)]
struct PriorMessage<'a> {
    role: Role,
    content: &'a str,
}

impl HttpAgentRuntime {
    /// Build a runtime client from configuration.
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        }
    }

    async fn start(&self, request: AgentRequest) -> Result<AgentRun> {
        let body = RunBody {
            application_id: &request.application_id,
            instruction: &request.instruction,
            tool_endpoint: &request.tool_endpoint,
            prior_conversation: request
                .prior_conversation
                .iter()
                .map(|m| PriorMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
        };

        let mut call = self
            .client
            .post(format!("{}/runs", self.endpoint))
            .json(&body);
        if !self.api_key.is_empty() {
            call = call.bearer_auth(&self.api_key);
        }
        let response = call
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AppError::Agent(format!("failed to start run: {e}")))?;

        info!(
            application_id = %request.application_id,
            prior = request.prior_conversation.len(),
            "agent run started"
        );

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(StreamReader::new(bytes), NdjsonCodec::new());

        let abort = CancellationToken::new();
        let events = lines
            .filter_map(|line| async move {
                match line {
                    Ok(line) => parse_output_line(&line).transpose(),
                    Err(err) => Some(Err(err)),
                }
            })
            .take_until(abort.clone().cancelled_owned())
            .inspect(|item| {
                if let Err(err) = item {
                    debug!(%err, "agent stream error");
                }
            })
            .boxed();

        Ok(AgentRun {
            events,
            abort: Some(abort),
        })
    }
}

impl AgentRuntime for HttpAgentRuntime {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, AgentRun> {
        Box::pin(self.start(request))
    }
}
