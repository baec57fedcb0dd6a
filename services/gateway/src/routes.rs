//! HTTP surface over the core
//!
//! The generate route drives the executor and is the one place a
//! `RequestMetric` is recorded: one metric per externally visible call,
//! whatever happened to the individual attempts. The status routes read the
//! aggregates; the refresh route hands manual triggers to the scheduler.

use std::time::Duration;
use std::time::Instant;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use gemini_executor::{ExecuteError, GenerateOptions, GenerateResult};
use gemini_metrics::{MetricStatus, RequestMetric};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, status_for};
use crate::state::AppState;

const GENERATE_ENDPOINT_LABEL: &str = "/v1/generate";

/// Body of `POST /v1/generate`.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub thinking_budget: Option<u32>,
    #[serde(default)]
    pub response_mime_type: Option<String>,
    #[serde(default)]
    pub response_json_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub use_google_search: bool,
    #[serde(default)]
    pub call_source: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl GenerateRequest {
    fn into_options(self) -> GenerateOptions {
        GenerateOptions {
            prompt: self.prompt,
            system_instruction: self.system_instruction,
            model: self.model,
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            thinking_budget: self.thinking_budget,
            response_mime_type: self.response_mime_type,
            response_json_schema: self.response_json_schema,
            use_google_search: self.use_google_search,
            call_source: self.call_source,
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Body of a successful generate response.
#[derive(Debug, Serialize)]
pub struct GenerateResponseBody {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thoughts: Option<String>,
    pub project_id: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<gemini_executor::UsageMetadata>,
}

/// `POST /v1/generate`
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    let started = Instant::now();
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let model = request.model.clone();
    let options = request.into_options();

    match state.executor.execute(options).await {
        Ok(result) => {
            info!(
                request_id,
                project_id = %result.project_id,
                latency_ms = result.latency_ms,
                "generate completed"
            );
            record_outcome(&state, &result, model, started).await;
            Json(GenerateResponseBody {
                text: result.text,
                thoughts: result.thoughts,
                project_id: result.project_id,
                latency_ms: result.latency_ms,
                usage: result.usage,
            })
            .into_response()
        }
        Err(error) => {
            warn!(request_id, kind = error.kind(), error = %error, "generate failed");
            record_failure(&state, &error, model, started).await;
            ApiError(error).into_response()
        }
    }
}

async fn record_outcome(
    state: &AppState,
    result: &GenerateResult,
    model: Option<String>,
    started: Instant,
) {
    let account = state.owner_of(&result.project_id).await;
    let mut metric = RequestMetric::new(
        GENERATE_ENDPOINT_LABEL,
        "POST",
        &account,
        &result.project_id,
        result.latency_ms,
        MetricStatus::Success,
    );
    metric.status_code = Some(200);
    metric.tokens_used = result.usage.as_ref().and_then(|u| u.total_token_count);
    metric.model = model;
    if let Err(e) = state.aggregator.record(metric).await {
        warn!(error = %e, "failed to record request metric");
    }
    crate::metrics::record_request(200, "POST", started.elapsed().as_secs_f64());
}

async fn record_failure(
    state: &AppState,
    error: &ExecuteError,
    model: Option<String>,
    started: Instant,
) {
    let project_id = match error {
        ExecuteError::Network { project_id, .. } | ExecuteError::Parse { project_id, .. } => {
            project_id.clone().unwrap_or_default()
        }
        _ => String::new(),
    };
    let account = if project_id.is_empty() {
        "unknown".to_string()
    } else {
        state.owner_of(&project_id).await
    };

    let status = status_for(error);
    let mut metric = RequestMetric::new(
        GENERATE_ENDPOINT_LABEL,
        "POST",
        &account,
        &project_id,
        started.elapsed().as_millis() as u64,
        MetricStatus::Error,
    );
    metric.status_code = Some(status.as_u16());
    metric.error_type = Some(error.kind().to_string());
    metric.model = model;
    if let Err(e) = state.aggregator.record(metric).await {
        warn!(error = %e, "failed to record request metric");
    }
    crate::metrics::record_request(status.as_u16(), "POST", started.elapsed().as_secs_f64());
    crate::metrics::record_upstream_error(error.kind());
}

/// `GET /health` — pool occupancy, credential counts, uptime.
pub async fn health(State(state): State<AppState>) -> Response {
    let stats = match state.selector.stats().await {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };
    let accounts = match state.tokens.load_all().await {
        Ok(map) => map.len(),
        Err(e) => return internal_error(e),
    };
    let usable = match state.tokens.valid().await {
        Ok(creds) => creds.len(),
        Err(e) => return internal_error(e),
    };

    let status = if stats.available > 0 {
        "healthy"
    } else if stats.total > 0 {
        "degraded"
    } else {
        "unhealthy"
    };
    Json(serde_json::json!({
        "status": status,
        "projects": stats,
        "accounts_total": accounts,
        "accounts_usable": usable,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

/// `GET /metrics` — Prometheus exposition.
pub async fn prometheus(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// `GET /v1/status/daily?start=YYYY-MM-DD&end=YYYY-MM-DD`
pub async fn daily_status(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> Response {
    let today = Utc::now().date_naive().to_string();
    let start = range.start.unwrap_or_else(|| today.clone());
    let end = range.end.unwrap_or(today);
    match state.aggregator.get_aggregated(&start, &end).await {
        Ok(aggregate) => Json(aggregate).into_response(),
        Err(gemini_metrics::Error::Parse(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": {"message": message}})),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: Option<String>,
}

/// `GET /v1/status/accounts?date=YYYY-MM-DD`
pub async fn account_status(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Response {
    let date = query
        .date
        .unwrap_or_else(|| Utc::now().date_naive().to_string());
    match state.aggregator.account_error_rates(&date).await {
        Ok(rates) => Json(serde_json::json!({"date": date, "accounts": rates})).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    pub project_id: String,
    pub daily_quota: u64,
}

/// `GET /v1/status/quota?project_id=...&daily_quota=N`
pub async fn quota_status(
    State(state): State<AppState>,
    Query(query): Query<QuotaQuery>,
) -> Response {
    match state
        .aggregator
        .predict_quota_exhaustion(&query.project_id, query.daily_quota)
        .await
    {
        Ok(prediction) => Json(serde_json::json!({
            "project_id": query.project_id,
            "exhaust_at": prediction.map(|t| t.to_rfc3339()),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    pub email: Option<String>,
}

/// `POST /v1/tokens/refresh` — refresh one account or run a full cycle.
pub async fn refresh_tokens(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Response {
    match request.email {
        Some(email) => {
            let outcome = state.scheduler.refresh_by_email(&email).await;
            state.selector.invalidate_memo();
            Json(serde_json::json!({"email": email, "result": outcome})).into_response()
        }
        None => {
            let outcomes = state.scheduler.cycle_now().await;
            state.selector.invalidate_memo();
            let results: Vec<_> = outcomes
                .into_iter()
                .map(|(email, outcome)| serde_json::json!({"email": email, "result": outcome}))
                .collect();
            Json(serde_json::json!({"results": results})).into_response()
        }
    }
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    warn!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": {"message": error.to_string()}})),
    )
        .into_response()
}
