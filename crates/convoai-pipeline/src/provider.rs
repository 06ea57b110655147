use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single plain-text message in the model prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Function definition sent to the model API — the static function-calling
/// vocabulary the dispatcher re-declares every turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A function call the model elected in its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Request to the model provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<PromptMessage>,
    pub max_tokens: u32,
    /// Functions to expose to the model. Empty is fine — the model then
    /// answers from its own knowledge.
    pub tools: Vec<ToolDefinition>,
    /// Raw JSON messages for the tool loop (overrides `messages` when set).
    /// The loop needs structured tool_calls / tool-result messages that
    /// plain strings can't represent.
    pub raw_messages: Option<Vec<serde_json::Value>>,
}

/// Response from the model provider.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
    /// Tool calls requested by the model. Empty when none were called.
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    /// A terminal completion carries no tool election.
    pub fn is_terminal(&self) -> bool {
        self.tool_calls.is_empty() || self.stop_reason != "tool_use"
    }
}

/// The narrow "chat completion with function calling" seam to the model
/// provider. Everything else about the provider is out of scope.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Send one completion request, wait for the full response.
    async fn complete(&self, req: &ChatRequest) -> Result<Completion, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}
