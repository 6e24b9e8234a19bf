//! Integration tests for queued notification delivery and the SMS sink.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use appgen_relay::config::NotifyConfig;
use appgen_relay::notify::{Notification, NotificationService, NotificationSink, SmsSink};
use appgen_relay::AppError;

use super::test_helpers::{eventually, RecordingSink};

const FAST_RETRY: Duration = Duration::from_millis(10);

fn notification(message: &str) -> Notification {
    Notification {
        recipient: "+15550100".into(),
        message: message.into(),
    }
}

#[tokio::test]
async fn worker_retries_until_delivery() {
    let sink = Arc::new(RecordingSink::failing_first(2));
    let (service, _worker) = NotificationService::start_with_delay(
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        3,
        FAST_RETRY,
    );

    service.enqueue(notification("ready")).expect("enqueue");

    let observed = Arc::clone(&sink);
    eventually(move || {
        let observed = Arc::clone(&observed);
        async move { (!observed.sent().is_empty()).then_some(()) }
    })
    .await;
    assert_eq!(sink.attempts(), 3);
    assert_eq!(sink.sent(), vec![notification("ready")]);
}

#[tokio::test]
async fn notification_is_dropped_after_max_attempts() {
    let sink = Arc::new(RecordingSink::failing_first(2));
    let (service, _worker) = NotificationService::start_with_delay(
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        2,
        FAST_RETRY,
    );

    service.enqueue(notification("first")).expect("enqueue");
    service.enqueue(notification("second")).expect("enqueue");

    let observed = Arc::clone(&sink);
    eventually(move || {
        let observed = Arc::clone(&observed);
        async move { (!observed.sent().is_empty()).then_some(()) }
    })
    .await;
    assert_eq!(sink.attempts(), 3);
    assert_eq!(sink.sent(), vec![notification("second")]);
}

#[tokio::test]
async fn service_acts_as_a_non_blocking_sink() {
    let sink = Arc::new(RecordingSink::default());
    let (service, _worker) = NotificationService::start_with_delay(
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        1,
        FAST_RETRY,
    );
    let as_sink: Arc<dyn NotificationSink> = Arc::new(service);

    as_sink.send(&notification("queued")).await.expect("queued");

    let observed = Arc::clone(&sink);
    eventually(move || {
        let observed = Arc::clone(&observed);
        async move { (observed.sent().len() == 1).then_some(()) }
    })
    .await;
}

#[tokio::test]
async fn enqueue_fails_once_worker_is_gone() {
    let sink = Arc::new(RecordingSink::default());
    let (service, worker) = NotificationService::start_with_delay(
        Arc::clone(&sink) as Arc<dyn NotificationSink>,
        1,
        FAST_RETRY,
    );
    worker.abort();
    let _ = worker.await;

    let err = service.enqueue(notification("late")).unwrap_err();
    assert!(matches!(err, AppError::Notify(_)));
}

type Captured = Arc<Mutex<Vec<(Option<String>, Value)>>>;

async fn capture(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    captured.lock().expect("lock").push((auth, body));
    StatusCode::OK
}

async fn reject() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn gateway() -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/sms/send", post(capture))
        .route("/sms/down", post(reject))
        .with_state(Arc::clone(&captured));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), captured)
}

fn sms_config(api_url: String) -> NotifyConfig {
    NotifyConfig {
        enabled: true,
        api_url,
        api_key: "sms-secret".into(),
        ..NotifyConfig::default()
    }
}

#[tokio::test]
async fn sms_sink_posts_recipient_and_message_with_bearer_key() {
    let (base, captured) = gateway().await;
    let sink = SmsSink::new(&sms_config(format!("{base}/sms/send")));

    sink.send(&notification("Your app is ready!"))
        .await
        .expect("delivered");

    let captured = captured.lock().expect("lock");
    assert_eq!(captured.len(), 1);
    let (auth, body) = &captured[0];
    assert_eq!(auth.as_deref(), Some("Bearer sms-secret"));
    assert_eq!(body["to"], "+15550100");
    assert_eq!(body["message"], "Your app is ready!");
}

#[tokio::test]
async fn sms_sink_reports_gateway_errors() {
    let (base, _captured) = gateway().await;
    let sink = SmsSink::new(&sms_config(format!("{base}/sms/down")));

    let err = sink.send(&notification("hello")).await.unwrap_err();
    assert!(matches!(err, AppError::Notify(ref msg) if msg.contains("sms gateway")));
}
