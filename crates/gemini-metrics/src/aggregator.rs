//! KV-backed daily metric aggregation
//!
//! One record per UTC date at `metrics:{YYYY-MM-DD}` with a 30-day TTL. A
//! 10-second per-date cache fronts KV reads; every record updates the cache.
//! Load-modify-save is last-write-wins, which the aggregate tolerates: it is
//! recomputable from the monotonically growing request list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use futures_util::future::join_all;
use kvstore::KvStore;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{Aggregate, DailyMetrics, RequestMetric};
use crate::{Error, Result};

/// Absolute retention for daily records.
pub const RETENTION: Duration = Duration::from_secs(2_592_000);

const KEY_PREFIX: &str = "metrics:";
const CACHE_TTL: Duration = Duration::from_secs(10);

/// An account's failure ratio for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountErrorRate {
    pub error_rate: f64,
    pub total: u64,
}

/// Real-time daily aggregation with TTL-bounded retention.
pub struct MetricsAggregator {
    kv: Arc<dyn KvStore>,
    cache: Mutex<HashMap<String, (DailyMetrics, Instant)>>,
}

impl MetricsAggregator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(date: &str) -> String {
        format!("{KEY_PREFIX}{date}")
    }

    /// Append one metric to its day and update the aggregate in place.
    pub async fn record(&self, metric: RequestMetric) -> Result<()> {
        let date = metric.date()?;
        let mut day = self
            .load_day(&date)
            .await?
            .unwrap_or_else(|| DailyMetrics::empty(&date));

        day.aggregate.apply(&metric);
        day.requests.push(metric);
        day.updated_at = Utc::now().to_rfc3339();

        let bytes = serde_json::to_vec(&day)
            .map_err(|e| Error::Parse(format!("serializing daily metrics: {e}")))?;
        self.kv
            .set(&Self::key(&date), &bytes, Some(RETENTION))
            .await?;

        self.cache
            .lock()
            .await
            .insert(date.clone(), (day, Instant::now()));
        debug!(date, "metric recorded");
        Ok(())
    }

    /// Load one day's record, via the 10-second cache.
    pub async fn load_day(&self, date: &str) -> Result<Option<DailyMetrics>> {
        {
            let cache = self.cache.lock().await;
            if let Some((day, at)) = cache.get(date)
                && at.elapsed() < CACHE_TTL
            {
                return Ok(Some(day.clone()));
            }
        }

        let Some(bytes) = self.kv.get(&Self::key(date)).await? else {
            return Ok(None);
        };
        let day: DailyMetrics = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Parse(format!("daily metrics {date}: {e}")))?;
        self.cache
            .lock()
            .await
            .insert(date.to_string(), (day.clone(), Instant::now()));
        Ok(Some(day))
    }

    /// Merge the aggregates of every day in `[start, end]` (inclusive,
    /// `YYYY-MM-DD`). Days load in parallel; missing days contribute
    /// nothing.
    pub async fn get_aggregated(&self, start: &str, end: &str) -> Result<Aggregate> {
        let start_date = parse_date(start)?;
        let end_date = parse_date(end)?;

        let mut dates = Vec::new();
        let mut cursor = start_date;
        while cursor <= end_date {
            dates.push(cursor.to_string());
            cursor = cursor
                .succ_opt()
                .ok_or_else(|| Error::Parse("date overflow".into()))?;
        }

        let days = join_all(dates.iter().map(|d| self.load_day(d))).await;

        let mut merged = Aggregate {
            period_start: format!("{start}T00:00:00Z"),
            period_end: format!("{end}T23:59:59Z"),
            ..Default::default()
        };
        for day in days {
            if let Some(day) = day? {
                merged.merge(&day.aggregate);
            }
        }
        Ok(merged)
    }

    /// Per-account failure ratios for one day.
    pub async fn account_error_rates(
        &self,
        date: &str,
    ) -> Result<HashMap<String, AccountErrorRate>> {
        let Some(day) = self.load_day(date).await? else {
            return Ok(HashMap::new());
        };
        Ok(day
            .aggregate
            .by_account
            .iter()
            .map(|(account, stats)| {
                let rate = if stats.total_requests == 0 {
                    0.0
                } else {
                    stats.failed_requests as f64 / stats.total_requests as f64
                };
                (
                    account.clone(),
                    AccountErrorRate {
                        error_rate: rate,
                        total: stats.total_requests,
                    },
                )
            })
            .collect())
    }

    /// Extrapolate when a project exhausts its daily quota, from today's
    /// usage rate. `None` when usage is too sparse to extrapolate or the
    /// projected exhaustion falls beyond today.
    pub async fn predict_quota_exhaustion(
        &self,
        project_id: &str,
        daily_quota: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let today = now.date_naive().to_string();
        let used = self
            .load_day(&today)
            .await?
            .and_then(|day| day.aggregate.by_project.get(project_id).cloned())
            .map(|stats| stats.total_requests)
            .unwrap_or(0);
        Ok(predict_at(now, used, daily_quota))
    }
}

/// Pure extrapolation, split out so tests can pin the clock.
fn predict_at(now: DateTime<Utc>, used: u64, daily_quota: u64) -> Option<DateTime<Utc>> {
    let remaining = daily_quota.saturating_sub(used);
    if remaining == 0 {
        return Some(now);
    }

    let hours_elapsed = now.hour() as f64
        + now.minute() as f64 / 60.0
        + now.second() as f64 / 3600.0;
    if hours_elapsed <= 0.0 || used == 0 {
        return None;
    }

    let used_per_hour = used as f64 / hours_elapsed;
    let hours_to_exhaust = remaining as f64 / used_per_hour;
    let exhaust_at = now + chrono::Duration::seconds((hours_to_exhaust * 3600.0) as i64);

    let end_of_day = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 23, 59, 59)
        .single()?;
    if exhaust_at <= end_of_day {
        Some(exhaust_at)
    } else {
        None
    }
}

fn parse_date(date: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| Error::Parse(format!("date {date}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MetricStatus;
    use kvstore::MemoryKv;

    fn aggregator() -> MetricsAggregator {
        MetricsAggregator::new(Arc::new(MemoryKv::new()))
    }

    fn metric_on(date: &str, status: MetricStatus, duration_ms: u64) -> RequestMetric {
        let mut m = RequestMetric::new("/gen", "POST", "acct-1", "proj-1", duration_ms, status);
        m.timestamp = format!("{date}T12:00:00+00:00");
        m
    }

    #[tokio::test]
    async fn record_maintains_conservation() {
        let agg = aggregator();
        for _ in 0..4 {
            agg.record(metric_on("2025-03-09", MetricStatus::Success, 10))
                .await
                .unwrap();
        }
        agg.record(metric_on("2025-03-09", MetricStatus::Error, 10))
            .await
            .unwrap();

        let day = agg.load_day("2025-03-09").await.unwrap().unwrap();
        assert_eq!(day.aggregate.total_requests, 5);
        assert_eq!(day.requests.len(), 5);
        assert_eq!(
            day.aggregate.successful_requests + day.aggregate.failed_requests,
            5
        );
    }

    #[tokio::test]
    async fn scenario_three_requests_one_endpoint() {
        let agg = aggregator();
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 100))
            .await
            .unwrap();
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 200))
            .await
            .unwrap();
        let mut failed = metric_on("2025-03-09", MetricStatus::Error, 300);
        failed.error_type = Some("rate_limit".into());
        agg.record(failed).await.unwrap();

        let day = agg.load_day("2025-03-09").await.unwrap().unwrap();
        let a = &day.aggregate;
        assert_eq!(a.total_requests, 3);
        assert_eq!(a.successful_requests, 2);
        assert_eq!(a.failed_requests, 1);
        assert!((a.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(a.error_breakdown["rate_limit"], 1);
        let endpoint = &a.by_endpoint["POST /gen"];
        assert_eq!(endpoint.total_requests, 3);
        assert!((endpoint.avg_duration_ms - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn metrics_split_by_utc_date() {
        let agg = aggregator();
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 10))
            .await
            .unwrap();
        agg.record(metric_on("2025-03-10", MetricStatus::Success, 10))
            .await
            .unwrap();

        assert_eq!(
            agg.load_day("2025-03-09")
                .await
                .unwrap()
                .unwrap()
                .aggregate
                .total_requests,
            1
        );
        assert_eq!(
            agg.load_day("2025-03-10")
                .await
                .unwrap()
                .unwrap()
                .aggregate
                .total_requests,
            1
        );
        assert!(agg.load_day("2025-03-11").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_aggregated_merges_range() {
        let agg = aggregator();
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 100))
            .await
            .unwrap();
        agg.record(metric_on("2025-03-10", MetricStatus::Success, 300))
            .await
            .unwrap();
        // Outside the queried range.
        agg.record(metric_on("2025-03-12", MetricStatus::Success, 999))
            .await
            .unwrap();

        let merged = agg.get_aggregated("2025-03-09", "2025-03-11").await.unwrap();
        assert_eq!(merged.total_requests, 2);
        assert!((merged.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(merged.period_start, "2025-03-09T00:00:00Z");
        assert_eq!(merged.period_end, "2025-03-11T23:59:59Z");
    }

    #[tokio::test]
    async fn get_aggregated_rejects_bad_dates() {
        let agg = aggregator();
        assert!(agg.get_aggregated("yesterday", "today").await.is_err());
    }

    #[tokio::test]
    async fn account_error_rates_for_day() {
        let agg = aggregator();
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 10))
            .await
            .unwrap();
        let mut failed = metric_on("2025-03-09", MetricStatus::Error, 10);
        failed.error_type = Some("server".into());
        agg.record(failed).await.unwrap();

        let mut other = metric_on("2025-03-09", MetricStatus::Success, 10);
        other.account_id = "acct-2".into();
        agg.record(other).await.unwrap();

        let rates = agg.account_error_rates("2025-03-09").await.unwrap();
        assert_eq!(rates["acct-1"].total, 2);
        assert!((rates["acct-1"].error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(rates["acct-2"].total, 1);
        assert!(rates["acct-2"].error_rate.abs() < f64::EPSILON);

        assert!(agg.account_error_rates("1999-01-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cache_serves_fresh_reads() {
        let kv = Arc::new(MemoryKv::new());
        let agg = MetricsAggregator::new(kv.clone());
        agg.record(metric_on("2025-03-09", MetricStatus::Success, 10))
            .await
            .unwrap();

        // Destroy the backing record: the cached view still answers.
        kv.del("metrics:2025-03-09").await.unwrap();
        assert!(agg.load_day("2025-03-09").await.unwrap().is_some());
    }

    #[test]
    fn predict_exhausted_quota_is_now() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 10, 0, 0).unwrap();
        assert_eq!(predict_at(now, 1000, 1000), Some(now));
        assert_eq!(predict_at(now, 1500, 1000), Some(now));
    }

    #[test]
    fn predict_no_usage_gives_no_prediction() {
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 10, 0, 0).unwrap();
        assert_eq!(predict_at(now, 0, 1000), None);
    }

    #[test]
    fn predict_extrapolates_within_today() {
        // 500 used in 10 hours: 50/hour; 500 remaining exhausts in 10 more
        // hours, at 20:00 — before end of day.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 10, 0, 0).unwrap();
        let predicted = predict_at(now, 500, 1000).unwrap();
        assert_eq!(predicted.hour(), 20);
        assert_eq!(predicted.day(), 9);
    }

    #[test]
    fn predict_beyond_today_is_none() {
        // 10 used in 10 hours: 1/hour; 990 remaining would take 990 hours.
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 10, 0, 0).unwrap();
        assert_eq!(predict_at(now, 10, 1000), None);
    }

    #[test]
    fn retention_is_thirty_days() {
        assert_eq!(RETENTION.as_secs(), 30 * 24 * 60 * 60);
    }
}
