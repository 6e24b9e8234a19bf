//! Unit tests for completion hook records.

use std::sync::Arc;

use chrono::{Duration, Utc};

use appgen_relay::models::hook::HookStatus;
use appgen_relay::models::session::{EndReason, Session};
use appgen_relay::persistence::db;
use appgen_relay::persistence::hook_repo::HookRepo;
use appgen_relay::persistence::session_repo::SessionRepo;

async fn completed_session(sessions: &SessionRepo, app: &str) -> Session {
    let session = Session::starting(app.into(), "make it".into(), None);
    sessions.insert(&session).await.expect("insert");
    sessions
        .complete_with_hook(&session, &session.finished(EndReason::Completed, None), None)
        .await
        .expect("complete")
        .expect("applied")
}

#[tokio::test]
async fn claim_succeeds_exactly_once() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let sessions = SessionRepo::new(Arc::clone(&database));
    let hooks = HookRepo::new(database);
    let done = completed_session(&sessions, "app-1").await;

    let claimed = hooks
        .claim(&done.stream_id)
        .await
        .expect("claim")
        .expect("first claim wins");
    assert_eq!(claimed.status, HookStatus::Claimed);
    assert!(claimed.claimed_at.is_some());

    assert!(hooks.claim(&done.stream_id).await.expect("claim").is_none());
}

#[tokio::test]
async fn claim_of_unknown_stream_is_none() {
    let hooks = HookRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    assert!(hooks.claim("missing").await.expect("claim").is_none());
}

#[tokio::test]
async fn list_pending_before_skips_claimed_and_recent() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let sessions = SessionRepo::new(Arc::clone(&database));
    let hooks = HookRepo::new(database);

    let pending = completed_session(&sessions, "app-1").await;
    let claimed = completed_session(&sessions, "app-2").await;
    hooks.claim(&claimed.stream_id).await.expect("claim");

    let later = Utc::now() + Duration::seconds(5);
    let listed = hooks.list_pending_before(later).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].stream_id, pending.stream_id);
    assert_eq!(listed[0].status, HookStatus::Pending);

    let earlier = Utc::now() - Duration::minutes(1);
    assert!(hooks.list_pending_before(earlier).await.expect("list").is_empty());
}
