//! Retention service for expired stream buffers.
//!
//! Runs as a background task deleting buffers whose grace period after the
//! terminal event has elapsed, together with their events and cancellation
//! requests. Subscribers asking for a collected buffer get `NotFound`.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::stream_repo::StreamRepo;

/// Spawn the buffer purge background task.
#[must_use]
pub fn spawn_retention_task(
    streams: StreamRepo,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match streams.purge_expired(Utc::now()).await {
                        Ok(0) => debug!("retention purge found nothing to collect"),
                        Ok(purged) => info!(purged, "retention purge completed"),
                        Err(err) => error!(%err, "retention purge failed"),
                    }
                }
            }
        }
    })
}
