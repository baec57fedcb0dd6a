//! Error types for credential operations

/// Errors from credential operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("store error: {0}")]
    Store(#[from] kvstore::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;
