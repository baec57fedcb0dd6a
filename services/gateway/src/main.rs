//! Gemini CloudCode gateway
//!
//! Single-binary Rust service that:
//! 1. Pools many Google-account credentials and their cloud projects
//! 2. Rotates generate-content requests across the healthiest project
//! 3. Refreshes OAuth tokens ahead of expiry in the background
//! 4. Aggregates per-day request telemetry with 30-day retention

mod admin;
mod config;
mod error;
mod metrics;
mod routes;
mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{delete, get, post};
use gemini_auth::TokenStore;
use gemini_executor::{Executor, HttpTransport};
use gemini_metrics::MetricsAggregator;
use gemini_pool::{ErrorClassifier, HealthSelector, ProjectStateStore, RefreshScheduler};
use kvstore::MemoryKv;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting gemini-gateway");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.upstream.endpoint,
        model = %config.generation.model,
        max_retries = config.retry.max_retries,
        "configuration loaded"
    );

    let prometheus = metrics::install_recorder();
    let http_client = reqwest::Client::new();

    // All persisted state shares one KV backend.
    let kv = Arc::new(MemoryKv::new());
    let tokens = Arc::new(TokenStore::new(kv.clone()));
    let states = Arc::new(ProjectStateStore::new(kv.clone()));
    let aggregator = Arc::new(MetricsAggregator::new(kv));

    let selector = Arc::new(HealthSelector::new(tokens.clone(), states));
    let classifier = ErrorClassifier::new(tokens.clone());
    let transport = Arc::new(HttpTransport::with_endpoint(
        http_client.clone(),
        config.upstream.endpoint.clone(),
    ));
    let executor = Arc::new(Executor::new(
        config.executor_config(),
        selector.clone(),
        classifier,
        transport,
    ));

    let scheduler = Arc::new(RefreshScheduler::new(
        tokens.clone(),
        http_client.clone(),
        config.oauth.client_id(),
        config.oauth.client_secret(),
    ));
    let refresh_task = scheduler
        .clone()
        .spawn(Duration::from_secs(config.refresh.interval_secs));

    let app_state = AppState {
        executor,
        selector,
        tokens,
        aggregator,
        scheduler,
        http_client,
        oauth_client_id: config.oauth.client_id(),
        oauth_client_secret: config.oauth.client_secret(),
        prometheus,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::prometheus))
        .route("/v1/generate", post(routes::generate))
        .route("/v1/status/daily", get(routes::daily_status))
        .route("/v1/status/accounts", get(routes::account_status))
        .route("/v1/status/quota", get(routes::quota_status))
        .route("/v1/tokens/refresh", post(routes::refresh_tokens))
        .route(
            "/v1/accounts",
            get(admin::list_accounts).post(admin::add_account),
        )
        .route("/v1/accounts/{email}", delete(admin::delete_account))
        .route(
            "/v1/accounts/{email}/discover",
            post(admin::discover_account_projects),
        )
        .route(
            "/v1/projects/{id}/cooldown/clear",
            post(admin::clear_project_cooldown),
        )
        .layer(tower::limit::ConcurrencyLimitLayer::new(512))
        .with_state(app_state);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    info!(addr = %config.server.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    refresh_task.abort();
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
