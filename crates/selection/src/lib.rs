//! Selector abstraction for project rotation
//!
//! Defines the `ProjectSelector` trait that decouples the request executor
//! from pool internals. The production selector holds the token cache, the
//! project-state store, and a short-lived memoization; tests substitute a
//! hand-written stub satisfying the same interface.
//!
//! Also home to the shared vocabulary that crosses the executor/pool
//! boundary: error kinds recorded against project state, and the verdict the
//! error classifier hands back to the attempt loop.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Classification of an upstream failure, recorded against project state.
///
/// Drives the cooldown computation: `NotLoggedIn` caps the cooldown at the
/// initial duration (re-authentication fixes it quickly), `QuotaExhausted`
/// stretches it to the quota reset time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Server,
    NotLoggedIn,
    QuotaExhausted,
    PreviewDisabled,
    BillingDisabled,
}

impl ErrorKind {
    /// Stable snake_case label for state records and metric histograms.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::NotLoggedIn => "not_logged_in",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::PreviewDisabled => "preview_disabled",
            ErrorKind::BillingDisabled => "billing_disabled",
        }
    }
}

/// Outcome of classifying an upstream HTTP failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the attempt loop should try again with a fresh selection.
    pub retry: bool,
    /// Cooldown to apply to the blamed project, when the status dictates one.
    pub reset_duration_ms: Option<u64>,
    /// Onboarding-verification URL surfaced from a 403 body.
    pub validation_url: Option<String>,
    /// Specific error kind recorded against the project.
    pub kind: ErrorKind,
    /// Absolute quota reset time (unix ms) parsed from a 429 body.
    pub quota_reset_time_ms: Option<u64>,
    /// Quota ceiling mentioned in the upstream message, for telemetry.
    pub quota: Option<f64>,
    /// Quota consumption mentioned in the upstream message, for telemetry.
    pub used: Option<f64>,
}

/// A project picked for one request, with everything the executor needs.
#[derive(Debug, Clone)]
pub struct Selection {
    pub project_id: String,
    pub owner_email: String,
    pub access_token: String,
    pub health_score: f64,
}

/// Pool occupancy counts for status surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectorStats {
    pub available: usize,
    pub in_cooldown: usize,
    pub total: usize,
}

/// Errors from selector operations (underlying store failures).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("selector store error: {0}")]
    Store(String),
}

/// Result alias for selector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Health-scored project rotation over the cross-account pool.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProjectSelector>`).
pub trait ProjectSelector: Send + Sync {
    /// Pick the healthiest eligible project, or `None` when no API-enabled
    /// project with a usable owner credential exists.
    fn select_for_request<'a>(
        &'a self,
        call_source: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Selection>>> + Send + 'a>>;

    /// Record a successful use of the project (resets its error streak).
    fn mark_used<'a>(
        &'a self,
        project_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Put the project on cooldown for the given duration.
    fn mark_cooldown<'a>(
        &'a self,
        project_id: &'a str,
        duration_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Record a failed use of the project with its classified kind.
    fn record_error<'a>(
        &'a self,
        project_id: &'a str,
        kind: ErrorKind,
        quota_reset_time_ms: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Pool occupancy counts.
    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<SelectorStats>> + Send + '_>>;
}
