//! Gateway configuration errors
//!
//! The one concern shared across the workspace: loading the gateway's TOML
//! configuration and rejecting settings the pool cannot run with. `Config`
//! is produced by validation (a zero retry budget, an empty model name);
//! `Io` and `Toml` convert from the read/parse path.

use thiserror::Error;

/// Errors from loading and validating gateway configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid gateway configuration: {0}")]
    Config(String),

    #[error("reading configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed configuration TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias for configuration loading
pub type Result<T> = std::result::Result<T, Error>;
