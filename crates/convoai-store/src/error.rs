use thiserror::Error;

/// All store-layer errors. Kept separate from ConvoError so the gateway can
/// map them to wire codes without coupling layers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Requester is neither the owner nor an admin with bypass rights.
    #[error("forbidden: {reason}")]
    Forbidden { reason: String },

    /// Conversation status is terminal; no further messages may be appended.
    #[error("conversation has ended: {id}")]
    Ended { id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for convoai_core::ConvoError {
    fn from(e: StoreError) -> Self {
        use convoai_core::ConvoError;
        match e {
            StoreError::NotFound { what, id } => ConvoError::NotFound { what, id },
            StoreError::Forbidden { reason } => ConvoError::Forbidden { reason },
            StoreError::Ended { id } => ConvoError::ConversationEnded { id },
            StoreError::Database(e) => ConvoError::Database(e.to_string()),
            StoreError::Serialization(m) => ConvoError::Internal(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
