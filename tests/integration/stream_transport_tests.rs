//! Integration tests for stream publish, close and replaying subscriptions.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use appgen_relay::config::StreamConfig;
use appgen_relay::models::event::{StartAt, StreamEventKind};
use appgen_relay::models::session::{EndReason, Session};
use appgen_relay::persistence::db::Database;
use appgen_relay::persistence::retry::RetryPolicy;
use appgen_relay::persistence::session_repo::SessionRepo;
use appgen_relay::stream::StreamTransport;
use appgen_relay::AppError;

use super::test_helpers::{collect, memory_db, WAIT};

fn fast_config() -> StreamConfig {
    StreamConfig {
        poll_interval_ms: 20,
        ..StreamConfig::default()
    }
}

fn delta(i: usize) -> StreamEventKind {
    StreamEventKind::TextDelta {
        text: format!("chunk {i}"),
    }
}

fn completed() -> StreamEventKind {
    StreamEventKind::Finish {
        reason: EndReason::Completed,
        message: Some("done".into()),
        cause: None,
    }
}

/// Open `stream_id` and make it the active attempt of `app`.
async fn open_active(db: &Arc<Database>, transport: &StreamTransport, app: &str, stream_id: &str) {
    let session = Session {
        stream_id: stream_id.to_owned(),
        ..Session::starting(app.to_owned(), "build".into(), None)
    };
    SessionRepo::new(Arc::clone(db))
        .insert(&session)
        .await
        .expect("insert session");
    transport.open(stream_id, app).await.expect("open");
}

async fn transport() -> (Arc<Database>, StreamTransport) {
    let db = memory_db().await;
    let transport = StreamTransport::new(Arc::clone(&db), RetryPolicy::none(), &fast_config());
    (db, transport)
}

#[tokio::test]
async fn live_and_late_subscribers_see_identical_sequences() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;

    // Attached before the first event.
    let live = tokio::spawn({
        let transport = transport.clone();
        async move { collect(&transport, "s1", StartAt::Sequence(0)).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    for i in 0..10 {
        let event = transport.publish("s1", delta(i)).await.expect("publish");
        assert_eq!(event.sequence, i as u64);
    }
    let marker = transport
        .close("s1", completed())
        .await
        .expect("close")
        .expect("first close");
    assert_eq!(marker.sequence, 10);

    let live = live.await.expect("live subscriber");
    assert_eq!(live.len(), 11);
    assert!(live
        .iter()
        .enumerate()
        .all(|(i, event)| event.sequence == i as u64));
    assert!(live[10].kind.is_terminal());

    let late = collect(&transport, "s1", StartAt::Sequence(0)).await;
    assert_eq!(late, live);

    let partial = collect(&transport, "s1", StartAt::Sequence(5)).await;
    assert_eq!(partial.len(), 6);
    assert_eq!(partial[0].sequence, 5);
}

#[tokio::test]
async fn tail_subscription_skips_history() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;
    for i in 0..3 {
        transport.publish("s1", delta(i)).await.expect("publish");
    }

    let tail = transport.subscribe("s1", StartAt::Tail).await.expect("subscribe");
    transport.publish("s1", delta(3)).await.expect("publish");
    transport.publish("s1", delta(4)).await.expect("publish");
    transport.close("s1", completed()).await.expect("close");

    let events: Vec<_> = tokio::time::timeout(WAIT, tail.collect::<Vec<_>>())
        .await
        .expect("tail ended");
    let sequences: Vec<u64> = events
        .into_iter()
        .map(|item| item.expect("event").sequence)
        .collect();
    assert_eq!(sequences, vec![3, 4, 5]);
}

#[tokio::test]
async fn subscribing_past_the_end_of_a_closed_stream_yields_nothing() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;
    transport.publish("s1", delta(0)).await.expect("publish");
    transport.close("s1", completed()).await.expect("close");

    assert!(collect(&transport, "s1", StartAt::Sequence(2)).await.is_empty());
}

#[tokio::test]
async fn unknown_stream_is_not_found() {
    let (_db, transport) = transport().await;
    let err = transport
        .subscribe("missing", StartAt::default())
        .await
        .err()
        .expect("subscribe fails");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn frozen_stream_rejects_publish_and_second_close() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;
    transport
        .close("s1", StreamEventKind::cancelled())
        .await
        .expect("close");

    let err = transport.publish("s1", delta(0)).await.unwrap_err();
    assert!(matches!(err, AppError::StreamClosed(_)));
    assert!(transport
        .close("s1", completed())
        .await
        .expect("close again")
        .is_none());
}

#[tokio::test]
async fn terminal_events_only_go_through_close() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;

    assert!(matches!(
        transport.publish("s1", completed()).await,
        Err(AppError::BadRequest(_))
    ));
    assert!(matches!(
        transport.close("s1", delta(0)).await,
        Err(AppError::BadRequest(_))
    ));
}

#[tokio::test]
async fn subscription_ends_when_stream_is_superseded() {
    let (db, transport) = transport().await;
    open_active(&db, &transport, "app-1", "s1").await;
    transport.publish("s1", delta(0)).await.expect("publish");

    let subscriber = tokio::spawn({
        let transport = transport.clone();
        async move { collect(&transport, "s1", StartAt::Sequence(0)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Record removed without a terminal marker, as after a force-clear
    // whose close never happened.
    SessionRepo::new(Arc::clone(&db))
        .delete("app-1")
        .await
        .expect("delete");

    let events = subscriber.await.expect("subscriber");
    assert_eq!(events.len(), 1);
    assert!(!events[0].kind.is_terminal());
}

#[tokio::test]
async fn expired_buffer_is_not_found() {
    let db = memory_db().await;
    let config = StreamConfig {
        grace_period_seconds: 0,
        ..fast_config()
    };
    let transport = StreamTransport::new(Arc::clone(&db), RetryPolicy::none(), &config);
    open_active(&db, &transport, "app-1", "s1").await;
    transport.close("s1", completed()).await.expect("close");

    let err = transport
        .subscribe("s1", StartAt::default())
        .await
        .err()
        .expect("expired");
    assert!(matches!(err, AppError::NotFound(_)));
}
