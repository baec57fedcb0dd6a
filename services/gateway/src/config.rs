//! Configuration types and loading
//!
//! TOML file resolved from `--config` or the default path next to the
//! binary. A missing file yields the built-in defaults so a bare gateway can
//! boot; every knob carries a sensible default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::Secret;
use gemini_executor::ExecutorConfig;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub generation: GenerationConfig,
    pub retry: RetryConfig,
    pub oauth: OauthConfig,
    pub refresh: RefreshConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8650".parse().expect("static listen addr"),
        }
    }
}

/// Generate-endpoint settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub endpoint: String,
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: gemini_executor::GENERATE_ENDPOINT.to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

/// Model defaults applied when a request does not override them
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub thinking_enabled: bool,
    pub thinking_budget_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-pro".to_string(),
            max_output_tokens: 65_536,
            temperature: 1.0,
            top_p: 0.95,
            thinking_enabled: true,
            thinking_budget_tokens: 32_768,
        }
    }
}

/// Attempt-loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

/// OAuth client overrides; the public gemini-cli client is the default
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OauthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<Secret<String>>,
}

impl OauthConfig {
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| gemini_auth::OAUTH_CLIENT_ID.to_string())
    }

    pub fn client_secret(&self) -> String {
        self.client_secret
            .as_ref()
            .map(|s| s.expose().clone())
            .unwrap_or_else(|| gemini_auth::OAUTH_CLIENT_SECRET.to_string())
    }
}

/// Background token refresh settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1_800,
        }
    }
}

impl Config {
    /// Resolve the config path from the CLI flag or the default.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        cli_path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from a TOML file; a missing file is the built-in
    /// default configuration. Settings the pool cannot run with are rejected
    /// here, at startup, rather than on the first request.
    pub fn load(path: &PathBuf) -> common::Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would wedge the request pipeline.
    fn validate(&self) -> common::Result<()> {
        if self.generation.model.is_empty() {
            return Err(common::Error::Config(
                "generation.model must not be empty".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(common::Error::Config(
                "retry.max_retries must be at least 1".into(),
            ));
        }
        if self.upstream.request_timeout_ms == 0 {
            return Err(common::Error::Config(
                "upstream.request_timeout_ms must be positive".into(),
            ));
        }
        if self.upstream.endpoint.is_empty() {
            return Err(common::Error::Config(
                "upstream.endpoint must not be empty".into(),
            ));
        }
        if self.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh.interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The executor view of this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            model: self.generation.model.clone(),
            max_output_tokens: self.generation.max_output_tokens,
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            thinking_enabled: self.generation.thinking_enabled,
            thinking_budget: self.generation.thinking_budget_tokens,
            max_retries: self.retry.max_retries,
            base_delay_ms: self.retry.base_delay_ms,
            request_timeout: Duration::from_millis(self.upstream.request_timeout_ms),
        }
    }
}
