// Verify the session wire format matches what deployed clients expect.
// These tests ensure protocol compatibility is never broken.

use convoai_core::error::ConvoError;
use convoai_core::types::MessageRole;
use convoai_protocol::frames::{ClientFrame, ServerFrame};

#[test]
fn send_message_frame_parses() {
    let json = r#"{"type":"send_message","content":"hello"}"#;
    let frame = ClientFrame::parse(json).unwrap();
    assert_eq!(
        frame,
        ClientFrame::SendMessage {
            content: "hello".to_string()
        }
    );
}

#[test]
fn end_frame_parses() {
    let json = r#"{"type":"end"}"#;
    assert_eq!(ClientFrame::parse(json).unwrap(), ClientFrame::End);
}

#[test]
fn malformed_frame_is_protocol_error() {
    let err = ClientFrame::parse("not json").unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");
}

#[test]
fn unknown_type_is_protocol_error() {
    let err = ClientFrame::parse(r#"{"type":"resume_session"}"#).unwrap_err();
    assert_eq!(err.code(), "PROTOCOL_ERROR");
}

#[test]
fn message_frame_serialization() {
    let frame = ServerFrame::message(
        MessageRole::Assistant,
        "hi alice",
        "msg-1",
        "2025-01-01T00:00:00Z",
    );
    let json = frame.to_json();

    assert!(json.contains(r#""type":"message""#));
    assert!(json.contains(r#""role":"assistant""#));
    assert!(json.contains(r#""message_id":"msg-1""#));
}

#[test]
fn error_frame_carries_wire_code() {
    let frame = ServerFrame::error(&ConvoError::Forbidden {
        reason: "not the owner".to_string(),
    });
    let json = frame.to_json();

    assert!(json.contains(r#""type":"error""#));
    assert!(json.contains(r#""kind":"FORBIDDEN""#));
    assert!(json.contains("not the owner"));
}

#[test]
fn backpressure_error_round_trip() {
    let frame = ServerFrame::error(&ConvoError::Backpressure);
    let parsed: ServerFrame = serde_json::from_str(&frame.to_json()).unwrap();
    match parsed {
        ServerFrame::Error { kind, .. } => assert_eq!(kind, "BACKPRESSURE"),
        other => panic!("expected error frame, got {:?}", other),
    }
}
