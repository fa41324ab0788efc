use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Service account not found: {0}")]
    NotFound(i64),

    #[error("Account name already exists: {0}")]
    DuplicateName(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AccountError>;
