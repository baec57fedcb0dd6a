//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] kvstore::Error),

    #[error("credential error: {0}")]
    Credential(#[from] gemini_auth::Error),

    #[error("state parse error: {0}")]
    Parse(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
