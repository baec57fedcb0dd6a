//! Per-request telemetry with daily aggregation
//!
//! Records one metric per externally visible call and maintains a per-day
//! aggregate in place: totals, duration averages recomputed from sums, an
//! error-kind histogram, and per-endpoint / per-account / per-project
//! breakdowns. Daily records live in the KV backend under
//! `metrics:{YYYY-MM-DD}` with a 30-day time-to-live.
//!
//! The executor does not emit metrics itself; its outermost caller (the
//! gateway's generate handler) records one metric per final outcome.

mod aggregator;
mod types;

pub use aggregator::{AccountErrorRate, MetricsAggregator, RETENTION};
pub use types::{
    AccountStats, Aggregate, DailyMetrics, EndpointStats, MetricStatus, ProjectStats,
    RequestMetric,
};

/// Errors from metric operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] kvstore::Error),

    #[error("metric parse error: {0}")]
    Parse(String),
}

/// Result alias for metric operations.
pub type Result<T> = std::result::Result<T, Error>;
