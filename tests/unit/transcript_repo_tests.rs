//! Unit tests for the conversation transcript.

use std::sync::Arc;

use appgen_relay::models::transcript::{Role, TranscriptMessage};
use appgen_relay::persistence::db;
use appgen_relay::persistence::transcript_repo::TranscriptRepo;

#[tokio::test]
async fn messages_are_listed_in_append_order_per_application() {
    let repo = TranscriptRepo::new(Arc::new(db::connect_memory().await.expect("db")));

    let messages = [
        TranscriptMessage::new("app-1".into(), Some("s1".into()), Role::User, "build a blog".into()),
        TranscriptMessage::new("app-2".into(), None, Role::User, "unrelated".into()),
        TranscriptMessage::new("app-1".into(), Some("s1".into()), Role::Assistant, "done".into()),
        TranscriptMessage::new("app-1".into(), Some("s2".into()), Role::User, "add comments".into()),
    ];
    for message in &messages {
        repo.append(message).await.expect("append");
    }

    let listed = repo.list("app-1").await.expect("list");
    let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["build a blog", "done", "add comments"]);
    assert_eq!(listed[1].role, Role::Assistant);
    assert_eq!(listed[2].stream_id.as_deref(), Some("s2"));
}

#[tokio::test]
async fn unknown_application_has_empty_transcript() {
    let repo = TranscriptRepo::new(Arc::new(db::connect_memory().await.expect("db")));
    assert!(repo.list("nobody").await.expect("list").is_empty());
}
