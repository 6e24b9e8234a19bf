//! JSON handlers for starting, stopping and inspecting generations.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::session::Session;
use crate::models::transcript::TranscriptMessage;
use crate::orchestrator::StartOutcome;
use crate::{AppError, Result};

use super::AppState;

/// Body of `POST /apps/{app_id}/generations`.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    /// What to build or change.
    pub instruction: String,
    /// Who to notify when the app is ready.
    #[serde(default)]
    pub notify_to: Option<String>,
}

/// Response of an admitted start.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartResponse {
    /// Identifier of the new attempt.
    pub stream_id: String,
    /// Where to subscribe to its output.
    pub stream_url: String,
}

/// Response of a stop request.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopResponse {
    /// Whether an active attempt was asked to stop.
    pub stop_requested: bool,
}

/// `POST /apps/{app_id}/generations`: start, preempting the active attempt.
pub async fn start_generation(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Json(request): Json<StartRequest>,
) -> Result<Response> {
    let outcome = state
        .generations
        .start(&app_id, &request.instruction, request.notify_to)
        .await?;

    match outcome {
        StartOutcome::Accepted(session) => {
            let body = StartResponse {
                stream_url: format!("/streams/{}", session.stream_id),
                stream_id: session.stream_id,
            };
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        StartOutcome::Busy => {
            let retry_after = state.config.coordinator.busy_retry_after_seconds;
            let mut response = AppError::Busy(format!(
                "a generation for {app_id} is still stopping; retry shortly"
            ))
            .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            Ok(response)
        }
    }
}

/// `POST /apps/{app_id}/stop`: request a stop without waiting.
pub async fn stop_generation(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Result<(StatusCode, Json<StopResponse>)> {
    let stop_requested = state
        .generations
        .coordinator()
        .request_stop(&app_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StopResponse { stop_requested })))
}

/// `GET /apps/{app_id}/session`: current session record.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Session>> {
    state
        .generations
        .coordinator()
        .current(&app_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no session for {app_id}")))
}

/// `GET /apps/{app_id}/transcript`: conversation history, oldest first.
pub async fn get_transcript(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
) -> Result<Json<Vec<TranscriptMessage>>> {
    state.transcripts.list(&app_id).await.map(Json)
}
