//! HTTP surface: start, stop, inspect and watch generations.
//!
//! Every node serves the full API; any node can admit, stop or stream any
//! application because all coordination state lives in the shared store.

pub mod handlers;
pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::GlobalConfig;
use crate::orchestrator::Generations;
use crate::persistence::transcript_repo::TranscriptRepo;
use crate::stream::StreamTransport;
use crate::{AppError, Result};

/// Shared state handed to every handler.
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// Admission and driver spawning.
    pub generations: Generations,
    /// Stream buffers for subscriptions.
    pub transport: StreamTransport,
    /// Conversation history.
    pub transcripts: TranscriptRepo,
}

/// Build the router with all routes mounted.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/apps/{app_id}/generations", post(handlers::start_generation))
        .route("/apps/{app_id}/stop", post(handlers::stop_generation))
        .route("/apps/{app_id}/session", get(handlers::get_session))
        .route("/apps/{app_id}/transcript", get(handlers::get_transcript))
        .route("/apps/{app_id}/stream", get(sse::stream_current))
        .route("/streams/{stream_id}", get(sse::stream_by_id))
        .with_state(state)
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// Serve the API on `0.0.0.0:{port}` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    info!(%bind, "starting HTTP API");
    serve_on(listener, state, ct).await
}

/// Serve the API on an already bound listener until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;
    info!("HTTP API shut down");
    Ok(())
}

/// HTTP status for an error.
#[must_use]
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
        AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Agent(_) | AppError::Environment(_) => StatusCode::BAD_GATEWAY,
        AppError::Superseded(_) | AppError::StreamClosed(_) => StatusCode::CONFLICT,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AppError::Db(_) | AppError::Config(_) | AppError::Notify(_) | AppError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            tracing::error!(err = %self, "request failed");
        }
        (
            status,
            Json(json!({ "error": self.to_string(), "retryable": self.is_retryable() })),
        )
            .into_response()
    }
}
