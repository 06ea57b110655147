use convoai_core::error::ConvoError;
use convoai_core::types::MessageRole;
use serde::{Deserialize, Serialize};

/// Client → Server frame.
/// Wire: `{ "type": "send_message", "content": "..." }` or `{ "type": "end" }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// One user turn. The session runs at most one turn at a time; a second
    /// send while a turn is in flight is queued (depth 1) or rejected.
    SendMessage { content: String },
    /// Client-initiated close. The server finishes nothing — any in-flight
    /// turn is cancelled.
    End,
}

/// Server → Client frame.
/// Wire: `{ "type": "message", "role": "assistant", ... }` or
///       `{ "type": "error", "kind": "FORBIDDEN", "detail": "..." }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        role: MessageRole,
        content: String,
        message_id: String,
        timestamp: String,
    },
    Error { kind: String, detail: String },
}

impl ServerFrame {
    pub fn message(
        role: MessageRole,
        content: impl Into<String>,
        message_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        ServerFrame::Message {
            role,
            content: content.into(),
            message_id: message_id.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Build an error frame from a core error, using its wire code as kind.
    pub fn error(err: &ConvoError) -> Self {
        ServerFrame::Error {
            kind: err.code().to_string(),
            detail: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ClientFrame {
    /// Parse an inbound text frame. Malformed JSON or an unknown `type`
    /// discriminator is a protocol error the caller decides how to handle.
    pub fn parse(text: &str) -> Result<Self, ConvoError> {
        serde_json::from_str(text)
            .map_err(|e| ConvoError::Protocol(format!("malformed frame: {}", e)))
    }
}
