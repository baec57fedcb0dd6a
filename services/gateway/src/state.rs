//! Shared application state for all handlers

use std::sync::Arc;
use std::time::Instant;

use gemini_auth::TokenStore;
use gemini_executor::Executor;
use gemini_metrics::MetricsAggregator;
use gemini_pool::{HealthSelector, RefreshScheduler};
use metrics_exporter_prometheus::PrometheusHandle;

/// Everything a route needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<Executor>,
    pub selector: Arc<HealthSelector>,
    pub tokens: Arc<TokenStore>,
    pub aggregator: Arc<MetricsAggregator>,
    pub scheduler: Arc<RefreshScheduler>,
    pub http_client: reqwest::Client,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Owner email of a project, resolved through the credential pool.
    pub async fn owner_of(&self, project_id: &str) -> String {
        match self.tokens.load_all().await {
            Ok(creds) => creds
                .into_values()
                .find(|c| c.projects.iter().any(|p| p.project_id == project_id))
                .map(|c| c.email)
                .unwrap_or_else(|| "unknown".to_string()),
            Err(_) => "unknown".to_string(),
        }
    }
}
