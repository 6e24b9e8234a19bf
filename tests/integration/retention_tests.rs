//! Integration tests for stream buffer retention.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use appgen_relay::config::StreamConfig;
use appgen_relay::models::event::{StartAt, StreamEventKind};
use appgen_relay::persistence::retention::spawn_retention_task;
use appgen_relay::persistence::retry::RetryPolicy;
use appgen_relay::persistence::stream_repo::StreamRepo;
use appgen_relay::stream::StreamTransport;
use appgen_relay::AppError;

use super::test_helpers::{eventually, memory_db};

#[tokio::test]
async fn retention_task_collects_expired_buffers_only() {
    let db = memory_db().await;
    let streams = StreamRepo::new(Arc::clone(&db));
    let now = Utc::now();

    streams.open("expired", "app-1").await.expect("open");
    streams
        .close(
            "expired",
            &StreamEventKind::cancelled(),
            now - chrono::Duration::seconds(1),
        )
        .await
        .expect("close");
    streams.open("retained", "app-2").await.expect("open");
    streams
        .close(
            "retained",
            &StreamEventKind::cancelled(),
            now + chrono::Duration::hours(1),
        )
        .await
        .expect("close");
    streams.open("live", "app-3").await.expect("open");

    let cancel = CancellationToken::new();
    let handle = spawn_retention_task(
        streams.clone(),
        Duration::from_millis(20),
        cancel.clone(),
    );

    let observed = streams.clone();
    eventually(move || {
        let observed = observed.clone();
        async move {
            observed
                .buffer("expired")
                .await
                .expect("read")
                .is_none()
                .then_some(())
        }
    })
    .await;
    assert!(streams.buffer("retained").await.expect("read").is_some());
    assert!(streams.buffer("live").await.expect("read").is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("retention stopped")
        .expect("retention task");
}

#[tokio::test]
async fn collected_stream_is_not_found_for_new_subscribers() {
    let db = memory_db().await;
    let transport = StreamTransport::new(
        Arc::clone(&db),
        RetryPolicy::none(),
        &StreamConfig::default(),
    );
    let streams = StreamRepo::new(Arc::clone(&db));

    transport.open("s1", "app-1").await.expect("open");
    transport
        .publish("s1", StreamEventKind::TextDelta { text: "hi".into() })
        .await
        .expect("publish");
    transport
        .close("s1", StreamEventKind::cancelled())
        .await
        .expect("close");
    assert!(transport.subscribe("s1", StartAt::default()).await.is_ok());

    let after_grace = Utc::now() + chrono::Duration::days(2);
    assert_eq!(streams.purge_expired(after_grace).await.expect("purge"), 1);

    let err = transport
        .subscribe("s1", StartAt::default())
        .await
        .err()
        .expect("collected");
    assert!(matches!(err, AppError::NotFound(_)));
}
