//! Unit tests for the agent output codec.

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::codec::FramedRead;

use appgen_relay::driver::codec::{parse_output_line, NdjsonCodec, MAX_LINE_BYTES};
use appgen_relay::driver::AgentOutput;
use appgen_relay::AppError;

#[tokio::test]
async fn frames_lines_including_unterminated_tail() {
    let input: &[u8] = b"{\"type\":\"text_delta\",\"text\":\"a\"}\n\n{\"type\":\"finish\"}";
    let lines: Vec<String> = FramedRead::new(input, NdjsonCodec::new())
        .map(|line| line.expect("line decodes"))
        .collect()
        .await;

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "");
    assert_eq!(lines[2], r#"{"type":"finish"}"#);
}

#[tokio::test]
async fn oversized_line_is_an_agent_error() {
    let mut input = vec![b'x'; MAX_LINE_BYTES + 1];
    input.push(b'\n');
    let mut frames = FramedRead::new(input.as_slice(), NdjsonCodec::default());

    let first = frames.next().await.expect("one frame");
    match first {
        Err(AppError::Agent(msg)) => assert!(msg.contains("line too long")),
        other => panic!("expected agent error, got {other:?}"),
    }
}

#[test]
fn parses_every_known_output_type() {
    assert_eq!(
        parse_output_line(r#"{"type":"text_delta","text":"hello"}"#).expect("parses"),
        Some(AgentOutput::TextDelta {
            text: "hello".into()
        })
    );
    assert_eq!(
        parse_output_line(r#"{"type":"tool_call","name":"write_file","input":{"path":"a.ts"}}"#)
            .expect("parses"),
        Some(AgentOutput::ToolCall {
            name: "write_file".into(),
            input: json!({"path": "a.ts"}),
        })
    );
    assert_eq!(
        parse_output_line(r#"{"type":"tool_result","name":"write_file"}"#).expect("parses"),
        Some(AgentOutput::ToolResult {
            name: "write_file".into(),
            output: serde_json::Value::Null,
        })
    );
    assert_eq!(
        parse_output_line(r#"{"type":"finish","message":"All set"}"#).expect("parses"),
        Some(AgentOutput::Finish {
            message: Some("All set".into())
        })
    );
}

#[test]
fn malformed_json_is_an_agent_error() {
    let err = parse_output_line("{not json").unwrap_err();
    assert!(matches!(err, AppError::Agent(ref msg) if msg.contains("malformed json")));
}

#[test]
fn known_type_with_missing_fields_is_rejected() {
    assert!(matches!(
        parse_output_line(r#"{"type":"text_delta"}"#),
        Err(AppError::Agent(_))
    ));
}
