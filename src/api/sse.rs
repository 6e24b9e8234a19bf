//! Server-Sent Events endpoints over the stream transport.
//!
//! Each SSE event carries the stream sequence as its `id`, so a reconnecting
//! client sending `Last-Event-ID` resumes exactly after the last event it saw.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::event::{StartAt, StreamEvent};
use crate::stream::EventStream;
use crate::{AppError, Result};

use super::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Query parameters for stream subscriptions.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// First sequence to deliver.
    pub from: Option<u64>,
    /// Deliver only events published after subscribing.
    #[serde(default)]
    pub tail: bool,
}

/// Resolve where a subscription starts.
///
/// `Last-Event-ID` wins over `from`, which wins over `tail`.
#[must_use]
pub fn start_position(query: &StreamQuery, headers: &HeaderMap) -> StartAt {
    let last_seen = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok());
    match (last_seen, query.from) {
        (Some(last), _) => StartAt::Sequence(last.saturating_add(1)),
        (None, Some(from)) => StartAt::Sequence(from),
        (None, None) if query.tail => StartAt::Tail,
        (None, None) => StartAt::default(),
    }
}

/// `GET /apps/{app_id}/stream`: the application's current attempt.
pub async fn stream_current(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let session = state
        .generations
        .coordinator()
        .current(&app_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no session for {app_id}")))?;
    let from = start_position(&query, &headers);
    debug!(app_id, stream_id = %session.stream_id, ?from, "subscribing to current stream");
    let events = state.transport.subscribe(&session.stream_id, from).await?;
    Ok(into_sse(events))
}

/// `GET /streams/{stream_id}`: an explicit attempt, while retained.
pub async fn stream_by_id(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let from = start_position(&query, &headers);
    let events = state.transport.subscribe(&stream_id, from).await?;
    Ok(into_sse(events))
}

fn into_sse(events: EventStream) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = events.map(|item| {
        Ok(match item {
            Ok(event) => to_sse_event(&event),
            Err(err) => {
                warn!(%err, "subscription ended with an error");
                Event::default().event("error").data(err.to_string())
            }
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .event(event.kind.name())
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
