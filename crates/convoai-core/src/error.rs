use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired at {expired_at}")]
    ExpiredToken { expired_at: i64 },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("Conversation {id} has ended")]
    ConversationEnded { id: String },

    #[error("Turn queue full, await the pending reply")]
    Backpressure,

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Tool server {server} unavailable: {reason}")]
    ToolServerUnavailable { server: String, reason: String },

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("WebSocket protocol error: {0}")]
    Protocol(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoError {
    /// Short error code string sent to clients in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ConvoError::Config(_) => "FATAL",
            ConvoError::InvalidToken(_) => "INVALID_TOKEN",
            ConvoError::ExpiredToken { .. } => "EXPIRED_TOKEN",
            ConvoError::Forbidden { .. } => "FORBIDDEN",
            ConvoError::NotFound { .. } => "NOT_FOUND",
            ConvoError::ConversationEnded { .. } => "CONVERSATION_ENDED",
            ConvoError::Backpressure => "BACKPRESSURE",
            ConvoError::UnknownTool { .. } => "UNKNOWN_TOOL",
            ConvoError::ToolServerUnavailable { .. } => "TOOL_SERVER_UNAVAILABLE",
            ConvoError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            ConvoError::Timeout { .. } => "TIMEOUT",
            ConvoError::Protocol(_) => "PROTOCOL_ERROR",
            ConvoError::Database(_) => "DATABASE_ERROR",
            ConvoError::Serialization(_) => "SERIALIZATION_ERROR",
            ConvoError::Io(_) => "IO_ERROR",
            ConvoError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error terminates the whole session (vs. a single turn).
    ///
    /// Auth failures require re-authentication; Config means the process
    /// itself is misassembled. Everything else is turn-scoped and the
    /// session stays open.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ConvoError::InvalidToken(_)
                | ConvoError::ExpiredToken { .. }
                | ConvoError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConvoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_session_fatal() {
        assert!(ConvoError::InvalidToken("bad".into()).is_session_fatal());
        assert!(ConvoError::ExpiredToken { expired_at: 0 }.is_session_fatal());
        assert!(!ConvoError::Backpressure.is_session_fatal());
        assert!(!ConvoError::Forbidden { reason: "not yours".into() }.is_session_fatal());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ConvoError::Backpressure.code(), "BACKPRESSURE");
        assert_eq!(
            ConvoError::NotFound { what: "conversation", id: "x".into() }.code(),
            "NOT_FOUND"
        );
    }
}
