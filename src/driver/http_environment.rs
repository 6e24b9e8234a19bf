//! Execution environment provider reached over HTTP.

use serde::Serialize;
use tracing::info;

use crate::config::EnvironmentConfig;
use crate::{AppError, Result};

use super::{BoxFuture, EnvironmentHandle, ExecutionEnvironment};

/// HTTP client for `POST {endpoint}/environments`.
#[derive(Clone)]
pub struct HttpEnvironmentProvider {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct EnvironmentBody<'a> {
    application_id: &'a str,
}

impl HttpEnvironmentProvider {
    /// Build a provider client from configuration.
    #[must_use]
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
        }
    }

    async fn acquire(&self, application_id: &str) -> Result<EnvironmentHandle> {
        let handle: EnvironmentHandle = self
            .client
            .post(format!("{}/environments", self.endpoint))
            .json(&EnvironmentBody { application_id })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AppError::Environment(format!("request failed: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::Environment(format!("invalid response: {e}")))?;

        info!(application_id, preview_url = %handle.preview_url, "environment ready");
        Ok(handle)
    }
}

impl ExecutionEnvironment for HttpEnvironmentProvider {
    fn request_environment<'a>(
        &'a self,
        application_id: &'a str,
    ) -> BoxFuture<'a, EnvironmentHandle> {
        Box::pin(self.acquire(application_id))
    }
}
