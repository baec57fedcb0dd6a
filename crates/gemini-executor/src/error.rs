//! Typed errors surfaced by the executor
//!
//! One tagged union for the whole request path; callers match on the
//! variant. The thin HTTP surface maps these onto response statuses.

/// Errors from `Executor::execute`.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// A required setting is absent or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// No API-enabled project with a usable owner credential exists.
    #[error("no projects available for selection")]
    SelectionFailed,

    /// Every attempt failed; carries the last error seen.
    #[error("all {attempts} attempts failed, last error: {last}")]
    AllFailed {
        attempts: u32,
        last: String,
        validation_url: Option<String>,
    },

    /// Timeout, transport failure, or a non-2xx classified as network.
    #[error("network error{}: {message}", project_suffix(.project_id))]
    Network {
        retryable: bool,
        project_id: Option<String>,
        message: String,
    },

    /// Unparseable or structurally invalid upstream JSON.
    #[error("invalid upstream response{}: {message}", project_suffix(.project_id))]
    Parse {
        project_id: Option<String>,
        message: String,
    },

    /// The upstream returned a 2xx carrying an error object.
    #[error("upstream API error {code} ({status}): {message}")]
    Upstream {
        code: i64,
        message: String,
        status: String,
        validation_url: Option<String>,
    },

    /// The caller's cancellation token tripped mid-flight.
    #[error("request cancelled")]
    Cancelled,
}

impl ExecuteError {
    /// Stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecuteError::Config(_) => "config",
            ExecuteError::SelectionFailed => "no_projects",
            ExecuteError::AllFailed { .. } => "all_failed",
            ExecuteError::Network { .. } => "network_error",
            ExecuteError::Parse { .. } => "parse_error",
            ExecuteError::Upstream { .. } => "upstream_api_error",
            ExecuteError::Cancelled => "cancelled",
        }
    }

    /// Whether another attempt could have succeeded.
    pub fn retryable(&self) -> bool {
        matches!(self, ExecuteError::Network { retryable: true, .. })
    }
}

fn project_suffix(project_id: &Option<String>) -> String {
    match project_id {
        Some(id) => format!(" (project {id})"),
        None => String::new(),
    }
}
