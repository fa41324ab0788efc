use thiserror::Error;

#[derive(Debug, Error)]
pub enum StringMatchError {
    #[error("Rule not found: {0}")]
    RuleNotFound(i64),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StringMatchError>;
