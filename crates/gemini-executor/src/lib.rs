//! Request executor for the CloudCode generate endpoint
//!
//! The one-shot attempt loop at the heart of the gateway: select the
//! healthiest project, build the upstream body, POST with the owner's bearer
//! token, classify failures, record blame against the project, back off with
//! jitter, and retry with a fresh selection. Bounded by a per-request
//! timeout and a caller-supplied cancellation token.
//!
//! The executor holds no mutable state beyond per-call locals; it is safe to
//! share behind an `Arc` and call from many tasks concurrently.

mod error;
mod executor;
mod request;
mod response;
mod transport;

pub use error::ExecuteError;
pub use executor::{Executor, ExecutorConfig, GenerateOptions, GenerateResult};
pub use response::{GenerateResponse, UsageMetadata};
pub use transport::{GENERATE_ENDPOINT, GenerateTransport, HttpTransport, RawResponse, TransportError};
