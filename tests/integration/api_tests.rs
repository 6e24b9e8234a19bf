//! Integration tests for the HTTP API, served on an ephemeral port.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use appgen_relay::api::handlers::{StartResponse, StopResponse};
use appgen_relay::api::{self, AppState};
use appgen_relay::models::session::{Session, SessionState};

use super::test_helpers::{build_script, FakeAgent, FakeEnvironment, Harness};

struct Server {
    base: String,
    harness: Harness,
    ct: CancellationToken,
    client: reqwest::Client,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

async fn serve(agent: FakeAgent) -> Server {
    let harness = Harness::new(agent, FakeEnvironment::ready()).await;
    let state = Arc::new(AppState {
        config: Arc::clone(&harness.config),
        generations: harness.generations.clone(),
        transport: harness.transport.clone(),
        transcripts: harness.transcripts(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = api::serve_on(listener, state, server_ct).await;
    });

    Server {
        base: format!("http://{addr}"),
        harness,
        ct,
        client: reqwest::Client::new(),
    }
}

impl Server {
    async fn start(&self, app: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/apps/{app}/generations", self.base))
            .json(&body)
            .send()
            .await
            .expect("request")
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let server = serve(FakeAgent::finishing(build_script())).await;
    let body = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn start_returns_stream_location_and_session_becomes_visible() {
    let server = serve(FakeAgent::finishing(build_script())).await;

    let response = server
        .start("app-1", json!({ "instruction": "build a bakery site" }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let started: StartResponse = response.json().await.expect("json");
    assert_eq!(started.stream_url, format!("/streams/{}", started.stream_id));

    let session = server
        .harness
        .wait_for_session("app-1", |s| s.state.is_terminal())
        .await;
    assert_eq!(session.stream_id, started.stream_id);

    let fetched: Session = server
        .client
        .get(format!("{}/apps/app-1/session", server.base))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(fetched.state, SessionState::Completed);
    assert_eq!(fetched.stream_id, started.stream_id);

    let transcript: Value = server
        .client
        .get(format!("{}/apps/app-1/transcript", server.base))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(transcript[0]["role"], "user");
    assert_eq!(transcript[0]["content"], "build a bakery site");
    assert_eq!(transcript[1]["role"], "assistant");
}

#[tokio::test]
async fn missing_session_is_a_json_404() {
    let server = serve(FakeAgent::finishing(build_script())).await;

    let response = server
        .client
        .get(format!("{}/apps/nobody/session", server.base))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["retryable"], false);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("nobody")));

    let stream = server
        .client
        .get(format!("{}/apps/nobody/stream", server.base))
        .send()
        .await
        .expect("request");
    assert_eq!(stream.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_instruction_is_a_bad_request() {
    let server = serve(FakeAgent::finishing(build_script())).await;
    let response = server.start("app-1", json!({ "instruction": "" })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stop_without_active_generation_reports_nothing_to_stop() {
    let server = serve(FakeAgent::finishing(build_script())).await;

    let response = server
        .client
        .post(format!("{}/apps/app-1/stop", server.base))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: StopResponse = response.json().await.expect("json");
    assert!(!body.stop_requested);
}

#[tokio::test]
async fn stop_cancels_active_generation() {
    let script = vec![appgen_relay::driver::AgentOutput::TextDelta {
        text: "partial".into(),
    }];
    let server = serve(FakeAgent::hanging(script)).await;

    let started: StartResponse = server
        .start("app-1", json!({ "instruction": "build" }))
        .await
        .json()
        .await
        .expect("json");
    server.harness.wait_for_events(&started.stream_id, 2).await;

    let body: StopResponse = server
        .client
        .post(format!("{}/apps/app-1/stop", server.base))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert!(body.stop_requested);

    let session = server
        .harness
        .wait_for_session("app-1", |s| s.state.is_terminal())
        .await;
    assert_eq!(
        session.end_reason,
        Some(appgen_relay::models::session::EndReason::Cancelled)
    );
}

#[tokio::test]
async fn unresponsive_attempt_yields_busy_with_retry_after() {
    let server = serve(FakeAgent::finishing(build_script())).await;
    // Admitted without a driver, so nothing will honor the stop.
    server
        .harness
        .coordinator
        .try_start("app-1", "stuck", None)
        .await
        .expect("admit");

    let response = server.start("app-1", json!({ "instruction": "again" })).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("2")
    );
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["retryable"], true);

    let retry = server.start("app-1", json!({ "instruction": "again" })).await;
    assert_eq!(retry.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn sse_replays_whole_stream_with_sequence_ids() {
    let server = serve(FakeAgent::finishing(build_script())).await;
    let started: StartResponse = server
        .start("app-1", json!({ "instruction": "build" }))
        .await
        .json()
        .await
        .expect("json");

    let body = server
        .client
        .get(format!("{}{}", server.base, started.stream_url))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body")
        .replace(": ", ":");

    assert!(body.contains("event:status"));
    assert!(body.contains("id:0"));
    assert!(body.contains("event:tool_call"));
    assert!(body.contains("id:5"));
    assert!(body.contains("event:finish"));
    assert!(body.contains("\"reason\":\"completed\""));
}

#[tokio::test]
async fn sse_resumes_after_last_event_id() {
    let server = serve(FakeAgent::finishing(build_script())).await;
    server
        .start("app-1", json!({ "instruction": "build" }))
        .await;
    server
        .harness
        .wait_for_session("app-1", |s| s.state.is_terminal())
        .await;

    let body = server
        .client
        .get(format!("{}/apps/app-1/stream", server.base))
        .header("Last-Event-ID", "4")
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body")
        .replace(": ", ":");

    assert!(!body.contains("id:4"));
    assert!(body.contains("id:5"));
    assert!(body.contains("event:finish"));
}
