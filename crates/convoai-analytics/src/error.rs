use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("rollup not found: {conversation_id}")]
    RollupNotFound { conversation_id: String },
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
