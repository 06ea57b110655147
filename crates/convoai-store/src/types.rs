use serde::{Deserialize, Serialize};

use convoai_core::types::{ConversationId, MessageId, MessageRole, ServerId, Subject};

/// Conversation lifecycle. `Ended` is terminal — append_message refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Ended,
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Immutable after creation; every authorization check keys on it.
    pub owner_subject: Subject,
    pub title: String,
    pub system_prompt: Option<String>,
    pub status: ConversationStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    /// Authoritative once written; downstream aggregators must not recompute.
    pub token_count: Option<u32>,
    /// Assistant messages only: user-turn receipt → assistant completion.
    pub response_time_ms: Option<i64>,
    pub model_name: Option<String>,
    pub created_at: String,
}

/// Fields a caller supplies when appending; id and created_at are generated
/// by the store so ordering stays monotonic per conversation.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub token_count: Option<u32>,
    pub response_time_ms: Option<i64>,
    pub model_name: Option<String>,
}

impl NewMessage {
    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            token_count: None,
            response_time_ms: None,
            model_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerRegistration {
    pub id: ServerId,
    pub owner_subject: Subject,
    pub name: String,
    pub description: String,
    /// Opaque to the core — only the dispatcher ever interprets it, and then
    /// only as "a network address to POST JSON-RPC at".
    pub endpoint_url: String,
    pub enabled: bool,
    pub created_at: String,
}
