//! Upstream error classification
//!
//! Maps an upstream HTTP status and response body to a verdict: whether the
//! attempt loop should retry, how long the blamed project cools down, and
//! any onboarding-validation URL that must be surfaced to operators.
//!
//! 429 bodies come in two message shapes:
//! - `"reset after {H}h {M}m {S}s"` — the quota window; classified
//!   quota_exhausted with an absolute reset time
//! - `"retry after {N}s"` — a transient rate limit
//! Anything else defaults to a 60-second rate limit. `quota: {N}` and
//! `used: {N}` decimals are extracted for telemetry when present.
//!
//! A 401 marks the owner credential invalid, best-effort: a failed store
//! write is logged and never changes the verdict.

use std::sync::Arc;
use std::sync::LazyLock;

use gemini_auth::TokenStore;
use regex::Regex;
use selection::{ErrorKind, Verdict};
use tracing::{info, warn};

static RESET_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"reset after(?:\s+(\d+)h)?(?:\s+(\d+)m)?(?:\s+(\d+)s)?").unwrap()
});
static RETRY_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"retry after\s+(\d+)s").unwrap());
static QUOTA_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"quota:\s*(\d+(?:\.\d+)?)").unwrap());
static QUOTA_USED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"used:\s*(\d+(?:\.\d+)?)").unwrap());

const RESET_401_MS: u64 = 300_000;
const RESET_403_MS: u64 = 600_000;
const RESET_403_VALIDATION_MS: u64 = 3_600_000;
const RESET_404_MS: u64 = 3_600_000;
const RESET_429_DEFAULT_MS: u64 = 60_000;
const RESET_503_MS: u64 = 30_000;

/// Classifier for upstream generate-content failures.
pub struct ErrorClassifier {
    tokens: Arc<TokenStore>,
}

impl ErrorClassifier {
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self { tokens }
    }

    /// Classify a non-2xx upstream response.
    ///
    /// `email` is the owner of the credential that made the call; it is only
    /// needed for the 401 invalidation side effect.
    pub async fn classify(
        &self,
        project_id: &str,
        status: u16,
        body: &str,
        email: Option<&str>,
    ) -> Verdict {
        match status {
            400 => {
                warn!(
                    project_id,
                    body = body_preamble(body),
                    "upstream rejected request as malformed"
                );
                non_retryable(ErrorKind::Server)
            }
            401 => {
                if let Some(email) = email {
                    let reason = format!("401 Unauthorized for project {project_id}");
                    if let Err(e) = self.tokens.mark_invalid(email, &reason).await {
                        warn!(email, error = %e, "failed to invalidate credential after 401");
                    }
                }
                Verdict {
                    retry: true,
                    reset_duration_ms: Some(RESET_401_MS),
                    validation_url: None,
                    kind: ErrorKind::NotLoggedIn,
                    quota_reset_time_ms: None,
                    quota: None,
                    used: None,
                }
            }
            403 => {
                let validation_url = extract_validation_url(body);
                let reset = if validation_url.is_some() {
                    RESET_403_VALIDATION_MS
                } else {
                    RESET_403_MS
                };
                if let Some(url) = &validation_url {
                    info!(project_id, url, "account requires one-time validation");
                }
                Verdict {
                    retry: true,
                    reset_duration_ms: Some(reset),
                    validation_url,
                    kind: kind_for_403(body),
                    quota_reset_time_ms: None,
                    quota: None,
                    used: None,
                }
            }
            404 => Verdict {
                retry: true,
                reset_duration_ms: Some(RESET_404_MS),
                validation_url: None,
                kind: ErrorKind::Server,
                quota_reset_time_ms: None,
                quota: None,
                used: None,
            },
            429 => classify_429(body),
            503 => Verdict {
                retry: true,
                reset_duration_ms: Some(RESET_503_MS),
                validation_url: None,
                kind: ErrorKind::Server,
                quota_reset_time_ms: None,
                quota: None,
                used: None,
            },
            s if s >= 500 => Verdict {
                retry: true,
                reset_duration_ms: None,
                validation_url: None,
                kind: ErrorKind::Server,
                quota_reset_time_ms: None,
                quota: None,
                used: None,
            },
            _ => non_retryable(ErrorKind::Server),
        }
    }
}

fn non_retryable(kind: ErrorKind) -> Verdict {
    Verdict {
        retry: false,
        reset_duration_ms: None,
        validation_url: None,
        kind,
        quota_reset_time_ms: None,
        quota: None,
        used: None,
    }
}

/// Classify a 429 body by its message grammar.
pub fn classify_429(body: &str) -> Verdict {
    let message = extract_error_message(body);
    let quota = QUOTA_LIMIT
        .captures(&message)
        .and_then(|c| c[1].parse::<f64>().ok());
    let used = QUOTA_USED
        .captures(&message)
        .and_then(|c| c[1].parse::<f64>().ok());

    if let Some(duration_ms) = parse_reset_after(&message) {
        return Verdict {
            retry: true,
            reset_duration_ms: Some(duration_ms),
            validation_url: None,
            kind: ErrorKind::QuotaExhausted,
            quota_reset_time_ms: Some(common::unix_ms() + duration_ms),
            quota,
            used,
        };
    }

    let duration_ms = RETRY_AFTER
        .captures(&message)
        .and_then(|c| c[1].parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or(RESET_429_DEFAULT_MS);

    Verdict {
        retry: true,
        reset_duration_ms: Some(duration_ms),
        validation_url: None,
        kind: ErrorKind::RateLimit,
        quota_reset_time_ms: None,
        quota,
        used,
    }
}

/// Sum the `{H}h {M}m {S}s` components of a `reset after` message. Any
/// component may be missing; all missing means zero. Returns `None` when the
/// phrase itself is absent.
fn parse_reset_after(message: &str) -> Option<u64> {
    let captures = RESET_AFTER.captures(message)?;
    let component = |i: usize| {
        captures
            .get(i)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let (hours, minutes, seconds) = (component(1), component(2), component(3));
    Some((hours * 3600 + minutes * 60 + seconds) * 1000)
}

/// The `error.message` string of a JSON error body, or the raw body when it
/// does not parse.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.to_string())
}

/// First `error.details[].metadata.validation_url` string in the body.
pub fn extract_validation_url(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;
    details.iter().find_map(|detail| {
        detail
            .get("metadata")?
            .get("validation_url")?
            .as_str()
            .map(|s| s.to_string())
    })
}

/// Map a 403 body onto the most specific error kind its message admits.
fn kind_for_403(body: &str) -> ErrorKind {
    let message = extract_error_message(body).to_lowercase();
    if message.contains("billing") {
        ErrorKind::BillingDisabled
    } else if message.contains("preview") {
        ErrorKind::PreviewDisabled
    } else {
        ErrorKind::Auth
    }
}

/// First 200 characters of a body, for log lines.
fn body_preamble(body: &str) -> &str {
    let end = body
        .char_indices()
        .take_while(|(i, _)| *i < 200)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKv;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(Arc::new(TokenStore::new(Arc::new(MemoryKv::new()))))
    }

    #[tokio::test]
    async fn status_400_does_not_retry() {
        let v = classifier().classify("p1", 400, "bad request", None).await;
        assert!(!v.retry);
        assert!(v.reset_duration_ms.is_none());
    }

    #[tokio::test]
    async fn status_401_retries_with_five_minute_reset() {
        let v = classifier().classify("p1", 401, "", None).await;
        assert!(v.retry);
        assert_eq!(v.reset_duration_ms, Some(300_000));
        assert_eq!(v.kind, ErrorKind::NotLoggedIn);
    }

    #[tokio::test]
    async fn status_401_invalidates_owner_credential() {
        let kv = Arc::new(MemoryKv::new());
        let tokens = Arc::new(TokenStore::new(kv));
        let now = common::unix_secs();
        tokens
            .save(
                "owner@x.com",
                gemini_auth::Credential::new("owner@x.com", "at".into(), 3600, now),
                false,
            )
            .await
            .unwrap();

        let classifier = ErrorClassifier::new(tokens.clone());
        classifier
            .classify("p1", 401, "", Some("owner@x.com"))
            .await;

        let cred = tokens.load("owner@x.com").await.unwrap().unwrap();
        assert!(cred.invalid);
        assert!(
            cred.invalid_reason
                .unwrap()
                .contains("401 Unauthorized for project p1")
        );
    }

    #[tokio::test]
    async fn status_401_without_email_still_verdicts() {
        let v = classifier().classify("p1", 401, "", None).await;
        assert!(v.retry);
    }

    #[tokio::test]
    async fn status_403_defaults_to_ten_minutes() {
        let v = classifier()
            .classify("p1", 403, r#"{"error":{"message":"PERMISSION_DENIED"}}"#, None)
            .await;
        assert!(v.retry);
        assert_eq!(v.reset_duration_ms, Some(600_000));
        assert!(v.validation_url.is_none());
        assert_eq!(v.kind, ErrorKind::Auth);
    }

    #[tokio::test]
    async fn status_403_with_validation_url_cools_an_hour() {
        let body = r#"{"error":{"code":403,"status":"PERMISSION_DENIED","details":[{"metadata":{"validation_url":"https://accounts.google.com/verify/x"}}]}}"#;
        let v = classifier().classify("p1", 403, body, None).await;
        assert!(v.retry);
        assert_eq!(v.reset_duration_ms, Some(3_600_000));
        assert_eq!(
            v.validation_url.as_deref(),
            Some("https://accounts.google.com/verify/x")
        );
    }

    #[tokio::test]
    async fn status_403_billing_and_preview_kinds() {
        let billing = r#"{"error":{"message":"Billing is disabled for this project"}}"#;
        let preview = r#"{"error":{"message":"Preview access is not enabled"}}"#;
        assert_eq!(
            classifier().classify("p1", 403, billing, None).await.kind,
            ErrorKind::BillingDisabled
        );
        assert_eq!(
            classifier().classify("p1", 403, preview, None).await.kind,
            ErrorKind::PreviewDisabled
        );
    }

    #[tokio::test]
    async fn status_404_cools_an_hour() {
        let v = classifier().classify("p1", 404, "", None).await;
        assert!(v.retry);
        assert_eq!(v.reset_duration_ms, Some(3_600_000));
    }

    #[tokio::test]
    async fn status_500_retries_without_cooldown() {
        let v = classifier().classify("p1", 500, "", None).await;
        assert!(v.retry);
        assert!(v.reset_duration_ms.is_none());
        assert_eq!(v.kind, ErrorKind::Server);
    }

    #[tokio::test]
    async fn status_503_cools_thirty_seconds() {
        let v = classifier().classify("p1", 503, "", None).await;
        assert!(v.retry);
        assert_eq!(v.reset_duration_ms, Some(30_000));
    }

    #[tokio::test]
    async fn other_5xx_retries_other_4xx_does_not() {
        assert!(classifier().classify("p1", 502, "", None).await.retry);
        assert!(classifier().classify("p1", 599, "", None).await.retry);
        assert!(!classifier().classify("p1", 418, "", None).await.retry);
        assert!(!classifier().classify("p1", 409, "", None).await.retry);
    }

    #[test]
    fn reset_after_full_components() {
        let body = r#"{"error":{"message":"Quota exceeded, reset after 21h 10m 20s","code":429}}"#;
        let v = classify_429(body);
        assert_eq!(v.reset_duration_ms, Some(76_220_000));
        assert_eq!(v.kind, ErrorKind::QuotaExhausted);
        let reset = v.quota_reset_time_ms.unwrap();
        let expected = common::unix_ms() + 76_220_000;
        assert!(reset >= expected - 2_000 && reset <= expected + 2_000);
    }

    #[test]
    fn reset_after_partial_components() {
        let v = classify_429(r#"{"error":{"message":"reset after 45m"}}"#);
        assert_eq!(v.reset_duration_ms, Some(2_700_000));
        let v = classify_429(r#"{"error":{"message":"reset after 2h 5s"}}"#);
        assert_eq!(v.reset_duration_ms, Some(7_205_000));
        let v = classify_429(r#"{"error":{"message":"reset after 30s"}}"#);
        assert_eq!(v.reset_duration_ms, Some(30_000));
    }

    #[test]
    fn reset_after_no_components_means_zero() {
        let v = classify_429(r#"{"error":{"message":"quota will reset after"}}"#);
        assert_eq!(v.reset_duration_ms, Some(0));
        assert_eq!(v.kind, ErrorKind::QuotaExhausted);
    }

    #[test]
    fn retry_after_seconds() {
        let body = r#"{"error":{"message":"please retry after 15s","code":429,"status":"RESOURCE_EXHAUSTED"}}"#;
        let v = classify_429(body);
        assert_eq!(v.reset_duration_ms, Some(15_000));
        assert_eq!(v.kind, ErrorKind::RateLimit);
        assert!(v.quota_reset_time_ms.is_none());
    }

    #[test]
    fn unparseable_429_defaults_to_a_minute() {
        let v = classify_429(r#"{"error":{"message":"Too many requests"}}"#);
        assert_eq!(v.reset_duration_ms, Some(60_000));
        assert_eq!(v.kind, ErrorKind::RateLimit);

        let v = classify_429("not json at all");
        assert_eq!(v.reset_duration_ms, Some(60_000));
    }

    #[test]
    fn quota_and_used_decimals_extracted() {
        let body = r#"{"error":{"message":"quota: 1000 used: 999.5, retry after 30s"}}"#;
        let v = classify_429(body);
        assert_eq!(v.quota, Some(1000.0));
        assert_eq!(v.used, Some(999.5));
        assert_eq!(v.reset_duration_ms, Some(30_000));
    }

    #[test]
    fn validation_url_walks_details() {
        let body = r#"{"error":{"details":[{"reason":"x"},{"metadata":{"validation_url":"https://v/1"}},{"metadata":{"validation_url":"https://v/2"}}]}}"#;
        assert_eq!(extract_validation_url(body).as_deref(), Some("https://v/1"));
        assert!(extract_validation_url(r#"{"error":{}}"#).is_none());
        assert!(extract_validation_url("garbage").is_none());
    }

    #[test]
    fn body_preamble_respects_char_boundaries() {
        let long = "é".repeat(300);
        let preamble = body_preamble(&long);
        assert!(preamble.len() <= 202);
        assert!(!preamble.is_empty());
        assert!(body_preamble("short").len() == 5);
    }
}
