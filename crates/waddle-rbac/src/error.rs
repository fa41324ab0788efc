use thiserror::Error;

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Role assignment requires an entity or community scope")]
    MissingScope,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RbacError>;
