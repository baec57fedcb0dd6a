//! Common types for the Gemini gateway workspace

mod error;
mod secret;
mod time;

pub use error::{Error, Result};
pub use secret::Secret;
pub use time::{unix_ms, unix_secs};
