//! Error types for store operations

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("encryption key error: {0}")]
    Key(String),

    #[error("decryption failed for account record")]
    Decrypt,

    #[error("duplicate refresh-token fingerprint")]
    Duplicate,

    #[error("account not found: {0}")]
    NotFound(i64),

    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
