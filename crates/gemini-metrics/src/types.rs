//! Metric records and the incrementally maintained daily aggregate

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final outcome of one externally visible call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Success,
    Error,
}

/// One request's telemetry, emitted once per final outcome (not per
/// attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    pub id: String,
    /// RFC-3339 UTC timestamp.
    pub timestamp: String,
    pub endpoint: String,
    pub method: String,
    pub account_id: String,
    pub project_id: String,
    pub duration_ms: u64,
    pub status: MetricStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl RequestMetric {
    /// A metric stamped with a fresh UUID and the current UTC time.
    pub fn new(
        endpoint: &str,
        method: &str,
        account_id: &str,
        project_id: &str,
        duration_ms: u64,
        status: MetricStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            account_id: account_id.to_string(),
            project_id: project_id.to_string(),
            duration_ms,
            status,
            status_code: None,
            error_type: None,
            tokens_used: None,
            model: None,
        }
    }

    /// UTC date (`YYYY-MM-DD`) this metric belongs to.
    pub fn date(&self) -> crate::Result<String> {
        let parsed: DateTime<Utc> = self
            .timestamp
            .parse()
            .map_err(|e| crate::Error::Parse(format!("metric timestamp {}: {e}", self.timestamp)))?;
        Ok(parsed.date_naive().to_string())
    }
}

/// Per-endpoint slot of the daily aggregate, keyed `"{METHOD} {endpoint}"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub total_requests: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
}

/// Per-account slot of the daily aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    #[serde(default)]
    pub error_breakdown: HashMap<String, u64>,
}

/// Per-project slot of the daily aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub total_requests: u64,
    pub tokens_used: u64,
}

/// The continuously maintained view over one day's requests.
///
/// Averages are always recomputed from `(sum / count)` on append, never from
/// a running mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub period_start: String,
    pub period_end: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    #[serde(default)]
    pub error_breakdown: HashMap<String, u64>,
    #[serde(default)]
    pub by_endpoint: HashMap<String, EndpointStats>,
    #[serde(default)]
    pub by_account: HashMap<String, AccountStats>,
    #[serde(default)]
    pub by_project: HashMap<String, ProjectStats>,
}

impl Aggregate {
    /// Empty aggregate spanning one UTC day.
    pub fn for_day(date: &str) -> Self {
        Self {
            period_start: format!("{date}T00:00:00Z"),
            period_end: format!("{date}T23:59:59Z"),
            ..Default::default()
        }
    }

    /// Fold one metric in, updating every slot it touches.
    pub fn apply(&mut self, metric: &RequestMetric) {
        self.total_requests += 1;
        self.total_duration_ms += metric.duration_ms;
        self.avg_duration_ms = self.total_duration_ms as f64 / self.total_requests as f64;

        match metric.status {
            MetricStatus::Success => self.successful_requests += 1,
            MetricStatus::Error => {
                self.failed_requests += 1;
                if let Some(kind) = &metric.error_type {
                    *self.error_breakdown.entry(kind.clone()).or_insert(0) += 1;
                }
            }
        }

        let endpoint_key = format!("{} {}", metric.method, metric.endpoint);
        let endpoint = self.by_endpoint.entry(endpoint_key).or_default();
        endpoint.total_requests += 1;
        endpoint.total_duration_ms += metric.duration_ms;
        endpoint.avg_duration_ms =
            endpoint.total_duration_ms as f64 / endpoint.total_requests as f64;

        let account = self
            .by_account
            .entry(metric.account_id.clone())
            .or_default();
        account.total_requests += 1;
        if metric.status == MetricStatus::Error {
            account.failed_requests += 1;
            if let Some(kind) = &metric.error_type {
                *account.error_breakdown.entry(kind.clone()).or_insert(0) += 1;
            }
        }

        let project = self
            .by_project
            .entry(metric.project_id.clone())
            .or_default();
        project.total_requests += 1;
        if let Some(tokens) = metric.tokens_used {
            project.tokens_used += tokens;
        }
    }

    /// Merge another day's aggregate in: totals summed, averages recomputed
    /// from the summed totals, nested maps merged slot-wise.
    pub fn merge(&mut self, other: &Aggregate) {
        self.total_requests += other.total_requests;
        self.successful_requests += other.successful_requests;
        self.failed_requests += other.failed_requests;
        self.total_duration_ms += other.total_duration_ms;
        self.avg_duration_ms = if self.total_requests == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total_requests as f64
        };

        for (kind, count) in &other.error_breakdown {
            *self.error_breakdown.entry(kind.clone()).or_insert(0) += count;
        }
        for (key, stats) in &other.by_endpoint {
            let slot = self.by_endpoint.entry(key.clone()).or_default();
            slot.total_requests += stats.total_requests;
            slot.total_duration_ms += stats.total_duration_ms;
            slot.avg_duration_ms = if slot.total_requests == 0 {
                0.0
            } else {
                slot.total_duration_ms as f64 / slot.total_requests as f64
            };
        }
        for (key, stats) in &other.by_account {
            let slot = self.by_account.entry(key.clone()).or_default();
            slot.total_requests += stats.total_requests;
            slot.failed_requests += stats.failed_requests;
            for (kind, count) in &stats.error_breakdown {
                *slot.error_breakdown.entry(kind.clone()).or_insert(0) += count;
            }
        }
        for (key, stats) in &other.by_project {
            let slot = self.by_project.entry(key.clone()).or_default();
            slot.total_requests += stats.total_requests;
            slot.tokens_used += stats.tokens_used;
        }
    }
}

/// One UTC day's persisted record: the append-only request list plus its
/// aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub date: String,
    pub requests: Vec<RequestMetric>,
    pub aggregate: Aggregate,
    pub updated_at: String,
}

impl DailyMetrics {
    pub fn empty(date: &str) -> Self {
        Self {
            date: date.to_string(),
            requests: Vec::new(),
            aggregate: Aggregate::for_day(date),
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}
