//! The attempt loop
//!
//! One `execute` call makes at most `max_retries` attempts. Each attempt
//! selects a fresh (project, token) pair, POSTs the generate body, and acts
//! on the outcome:
//!
//! - transport failure: blame the project (`server`, 30-second cooldown),
//!   back off, retry
//! - non-2xx: classify; record the specific kind; apply the verdict's
//!   cooldown; abort on non-retryable verdicts, otherwise back off and retry
//! - 2xx: parse, mark the project used, return the flattened text
//!
//! Backoff is `min(30s, base * 2^(attempt-1) + jitter)` and cancellable.
//! Side-effect failures (cooldown writes, error counters) are logged and
//! never mask the request outcome. At exhaustion, transport failures surface
//! unchanged; classified upstream failures collapse into `AllFailed`
//! carrying the last error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gemini_pool::ErrorClassifier;
use selection::{ErrorKind, ProjectSelector, Verdict};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecuteError;
use crate::request::build_request_body;
use crate::response::{GenerateResponse, UsageMetadata};
use crate::transport::{GenerateTransport, TransportError};

/// Cooldown applied to a project after a transport-level failure.
const TRANSPORT_COOLDOWN_MS: u64 = 30_000;
/// Ceiling for the per-attempt backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Tunables read at construction; see the gateway config for the loader.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub thinking_enabled: bool,
    pub thinking_budget: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub request_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-pro".to_string(),
            max_output_tokens: 65_536,
            temperature: 1.0,
            top_p: 0.95,
            thinking_enabled: true,
            thinking_budget: 32_768,
            max_retries: 3,
            base_delay_ms: 1_000,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    fn validate(&self) -> Result<(), ExecuteError> {
        if self.model.is_empty() {
            return Err(ExecuteError::Config("model name is empty".into()));
        }
        if self.max_retries == 0 {
            return Err(ExecuteError::Config("max_retries must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(ExecuteError::Config("request timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Per-call inputs; unset overrides fall back to the executor config.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub thinking_budget: Option<u32>,
    pub response_mime_type: Option<String>,
    pub response_json_schema: Option<serde_json::Value>,
    pub use_google_search: bool,
    pub call_source: Option<String>,
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Successful outcome of one generate call.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub thoughts: Option<String>,
    pub project_id: String,
    pub latency_ms: u64,
    pub usage: Option<UsageMetadata>,
}

/// The request-execution pipeline. Stateless between calls; share via `Arc`.
pub struct Executor {
    config: ExecutorConfig,
    selector: Arc<dyn ProjectSelector>,
    classifier: ErrorClassifier,
    transport: Arc<dyn GenerateTransport>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        selector: Arc<dyn ProjectSelector>,
        classifier: ErrorClassifier,
        transport: Arc<dyn GenerateTransport>,
    ) -> Self {
        Self {
            config,
            selector,
            classifier,
            transport,
        }
    }

    /// Run one generate call to completion.
    pub async fn execute(&self, options: GenerateOptions) -> Result<GenerateResult, ExecuteError> {
        self.execute_cancellable(options, CancellationToken::new())
            .await
    }

    /// Run one generate call; tripping `cancel` aborts the in-flight
    /// request and ends the retry loop.
    pub async fn execute_cancellable(
        &self,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> Result<GenerateResult, ExecuteError> {
        self.config.validate()?;

        let started = Instant::now();
        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let call_source = options.call_source.clone();

        let mut last_err: Option<ExecuteError> = None;
        let mut last_was_transport = false;
        let mut last_validation_url: Option<String> = None;

        for attempt in 1..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(ExecuteError::Cancelled);
            }

            let selection = match self.selector.select_for_request(call_source.as_deref()).await {
                Ok(Some(selection)) => selection,
                Ok(None) => return Err(ExecuteError::SelectionFailed),
                Err(e) => {
                    warn!(attempt, error = %e, "selector unavailable");
                    last_err = Some(ExecuteError::Network {
                        retryable: true,
                        project_id: None,
                        message: format!("selector unavailable: {e}"),
                    });
                    last_was_transport = true;
                    if attempt < self.config.max_retries {
                        self.backoff(attempt, &cancel).await?;
                    }
                    continue;
                }
            };
            let project_id = selection.project_id.clone();
            debug!(
                attempt,
                project_id,
                score = selection.health_score,
                "attempting upstream call"
            );

            let body = build_request_body(&self.config, &options, &project_id);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
                result = tokio::time::timeout(
                    timeout,
                    self.transport.post_generate(&body, &selection.access_token),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(TransportError::Timeout),
                },
            };

            let raw = match outcome {
                Ok(raw) => raw,
                Err(transport_err) => {
                    warn!(attempt, project_id, error = %transport_err, "transport failure");
                    self.blame_transport(&project_id).await;
                    last_err = Some(ExecuteError::Network {
                        retryable: true,
                        project_id: Some(project_id),
                        message: transport_err.to_string(),
                    });
                    last_was_transport = true;
                    if attempt < self.config.max_retries {
                        self.backoff(attempt, &cancel).await?;
                    }
                    continue;
                }
            };

            if !(200..300).contains(&raw.status) {
                let verdict = self
                    .classifier
                    .classify(
                        &project_id,
                        raw.status,
                        &raw.body,
                        Some(&selection.owner_email),
                    )
                    .await;
                self.apply_verdict(&project_id, &verdict).await;
                if verdict.validation_url.is_some() {
                    last_validation_url = verdict.validation_url.clone();
                }

                let err = ExecuteError::Network {
                    retryable: verdict.retry,
                    project_id: Some(project_id.clone()),
                    message: format!("upstream returned {}", raw.status),
                };
                if !verdict.retry {
                    return Err(err);
                }
                last_err = Some(err);
                last_was_transport = false;
                if attempt < self.config.max_retries {
                    self.backoff(attempt, &cancel).await?;
                }
                continue;
            }

            return self
                .handle_success_status(&project_id, &raw.body, started)
                .await;
        }

        let attempts = self.config.max_retries;
        let last = last_err.unwrap_or(ExecuteError::SelectionFailed);
        if last_was_transport {
            Err(last)
        } else {
            Err(ExecuteError::AllFailed {
                attempts,
                last: last.to_string(),
                validation_url: last_validation_url,
            })
        }
    }

    /// Parse a 2xx body and settle the call.
    async fn handle_success_status(
        &self,
        project_id: &str,
        body: &str,
        started: Instant,
    ) -> Result<GenerateResult, ExecuteError> {
        let response: GenerateResponse = match serde_json::from_str(body) {
            Ok(response) => response,
            Err(e) => {
                self.record_error(project_id, ErrorKind::Server, None).await;
                return Err(ExecuteError::Parse {
                    project_id: Some(project_id.to_string()),
                    message: format!("unparseable upstream JSON: {e}"),
                });
            }
        };

        if !response.is_valid() {
            self.record_error(project_id, ErrorKind::Server, None).await;
            return Err(ExecuteError::Parse {
                project_id: Some(project_id.to_string()),
                message: "invalid response structure: no candidates and no error".into(),
            });
        }

        if let Some(api_error) = response.error {
            self.record_error(project_id, ErrorKind::Server, None).await;
            return Err(ExecuteError::Upstream {
                code: api_error.code,
                message: api_error.message,
                status: api_error.status,
                validation_url: None,
            });
        }

        let (text, thoughts) = response.flatten_parts();
        if let Err(e) = self.selector.mark_used(project_id).await {
            warn!(project_id, error = %e, "failed to record project usage");
        }

        Ok(GenerateResult {
            text,
            thoughts,
            project_id: project_id.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            usage: response.usage_metadata,
        })
    }

    /// Blame a transport failure on the selected project.
    async fn blame_transport(&self, project_id: &str) {
        self.record_error(project_id, ErrorKind::Server, None).await;
        if let Err(e) = self
            .selector
            .mark_cooldown(project_id, TRANSPORT_COOLDOWN_MS)
            .await
        {
            warn!(project_id, error = %e, "failed to apply transport cooldown");
        }
    }

    /// Record the classified kind and apply the verdict's cooldown.
    async fn apply_verdict(&self, project_id: &str, verdict: &Verdict) {
        self.record_error(project_id, verdict.kind, verdict.quota_reset_time_ms)
            .await;
        if let Some(reset_ms) = verdict.reset_duration_ms
            && let Err(e) = self.selector.mark_cooldown(project_id, reset_ms).await
        {
            warn!(project_id, error = %e, "failed to apply verdict cooldown");
        }
    }

    async fn record_error(
        &self,
        project_id: &str,
        kind: ErrorKind,
        quota_reset_time_ms: Option<u64>,
    ) {
        if let Err(e) = self
            .selector
            .record_error(project_id, kind, quota_reset_time_ms)
            .await
        {
            warn!(project_id, error = %e, "failed to record project error");
        }
    }

    /// Cancellable jittered backoff between attempts.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), ExecuteError> {
        let delay = backoff_delay_ms(self.config.base_delay_ms, attempt);
        debug!(attempt, delay_ms = delay, "backing off before retry");
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(delay)) => Ok(()),
        }
    }
}

/// `min(30s, base * 2^(attempt-1) + jitter)` where jitter is under a second.
fn backoff_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let exponential = base_delay_ms.saturating_mul(1u64 << exponent);
    let jitter = (rand::random::<f64>() * 1000.0) as u64;
    exponential.saturating_add(jitter).min(MAX_BACKOFF_MS)
}
