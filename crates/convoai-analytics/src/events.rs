use serde::{Deserialize, Serialize};

/// User activity event — login, logout, conversation_started, and the like.
/// Append-only audit data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub subject: String,
    pub kind: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One HTTP request against the management surface. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCall {
    pub endpoint: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub status: u16,
    pub latency_ms: i64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Created,
    Deleted,
}

impl std::fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLifecycle {
    pub conversation_id: String,
    pub subject: String,
    pub action: LifecycleAction,
    pub timestamp: String,
}

/// Per-message accounting record. One per tracked message; the rollup for
/// its conversation is derived from these and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetric {
    pub message_id: String,
    pub conversation_id: String,
    pub subject: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub timestamp: String,
}

/// Maintained aggregate over one conversation's tracked messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRollup {
    pub conversation_id: String,
    pub owner_subject: String,
    pub message_count: i64,
    pub total_tokens: i64,
    /// Mean over assistant messages with a known positive response time.
    /// `assistant_count` is the divisor — never `message_count`.
    pub avg_response_time_s: f64,
    pub assistant_count: i64,
    pub updated_at: String,
}
