//! Proactive background token refresh
//!
//! A periodic task asks the token store for credentials expiring within the
//! refresh window and refreshes them concurrently (settle-all: one bad
//! account never stops the cycle). Saves preserve metadata so a response
//! omitting the refresh token keeps the stored one. A cycle-skip flag
//! prevents overlapping runs; the first cycle is delayed a few seconds after
//! boot so startup traffic settles first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use gemini_auth::{Credential, TokenStore};
use serde::Serialize;
use tracing::{debug, info, warn};

/// How far ahead of expiry a token becomes a refresh candidate.
pub const REFRESH_WINDOW_MS: u64 = 300_000;
/// Cadence of the background cycle.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1800);

const STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Per-credential outcome of a refresh attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// New access token stored.
    Refreshed,
    /// No refresh token on file; nothing to do.
    NoRefreshToken,
    /// The token endpoint rejected the refresh token; credential invalidated.
    Rejected(String),
    /// Transient failure; the stale credential is preserved for the next
    /// cycle.
    Failed(String),
}

/// Background token refresher with manual triggers.
pub struct RefreshScheduler {
    tokens: Arc<TokenStore>,
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    in_cycle: AtomicBool,
}

impl RefreshScheduler {
    pub fn new(
        tokens: Arc<TokenStore>,
        client: reqwest::Client,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            tokens,
            client,
            client_id,
            client_secret,
            in_cycle: AtomicBool::new(false),
        }
    }

    /// Spawn the periodic refresh task.
    ///
    /// Runs one delayed cycle shortly after boot, then on every `interval`
    /// tick. Returns the `JoinHandle` for the spawned task.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DELAY).await;
            self.cycle_now().await;

            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the startup cycle covered it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cycle_now().await;
            }
        })
    }

    /// Run one refresh cycle over every credential nearing expiry.
    ///
    /// Returns per-email outcomes. An already-running cycle is not doubled:
    /// the overlapping call returns empty.
    pub async fn cycle_now(&self) -> Vec<(String, RefreshOutcome)> {
        if self.in_cycle.swap(true, Ordering::SeqCst) {
            warn!("refresh cycle already running, skipping");
            return Vec::new();
        }

        let outcomes = self.run_cycle().await;
        self.in_cycle.store(false, Ordering::SeqCst);
        outcomes
    }

    async fn run_cycle(&self) -> Vec<(String, RefreshOutcome)> {
        let candidates = match self.tokens.needing_refresh(REFRESH_WINDOW_MS).await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "refresh cycle could not list candidates");
                return Vec::new();
            }
        };

        if candidates.is_empty() {
            debug!("no tokens need refresh");
            return Vec::new();
        }
        info!(candidates = candidates.len(), "refreshing expiring tokens");

        let outcomes = join_all(candidates.iter().map(|cred| async {
            let outcome = self.refresh_credential(cred).await;
            (cred.email.clone(), outcome)
        }))
        .await;

        for (email, outcome) in &outcomes {
            match outcome {
                RefreshOutcome::Refreshed => info!(email, "token refreshed"),
                RefreshOutcome::NoRefreshToken => debug!(email, "no refresh token on file"),
                RefreshOutcome::Rejected(msg) => {
                    warn!(email, error = %msg, "refresh token rejected, credential invalidated")
                }
                RefreshOutcome::Failed(msg) => {
                    warn!(email, error = %msg, "refresh failed, keeping stale credential")
                }
            }
        }
        outcomes
    }

    /// Refresh one account immediately, regardless of its expiry.
    pub async fn refresh_by_email(&self, email: &str) -> RefreshOutcome {
        match self.tokens.load(email).await {
            Ok(Some(cred)) => self.refresh_credential(&cred).await,
            Ok(None) => RefreshOutcome::Failed(format!("no credential for {email}")),
            Err(e) => RefreshOutcome::Failed(e.to_string()),
        }
    }

    async fn refresh_credential(&self, cred: &Credential) -> RefreshOutcome {
        let Some(refresh) = &cred.refresh_token else {
            return RefreshOutcome::NoRefreshToken;
        };

        match gemini_auth::refresh_token(&self.client, refresh, &self.client_id, &self.client_secret)
            .await
        {
            Ok(response) => {
                let now = common::unix_secs();
                let mut updated = Credential::new(
                    &cred.email,
                    response.access_token,
                    response.expires_in,
                    now,
                );
                updated.refresh_token = response.refresh_token;
                updated.scope = response.scope.unwrap_or_else(|| cred.scope.clone());
                if let Some(token_type) = response.token_type {
                    updated.token_type = token_type;
                }
                match self.tokens.save(&cred.email, updated, true).await {
                    Ok(()) => RefreshOutcome::Refreshed,
                    Err(e) => RefreshOutcome::Failed(format!("persisting refreshed token: {e}")),
                }
            }
            Err(gemini_auth::Error::InvalidCredentials(msg)) => {
                if let Err(e) = self
                    .tokens
                    .mark_invalid(&cred.email, "refresh token rejected")
                    .await
                {
                    warn!(email = %cred.email, error = %e, "failed to invalidate credential");
                }
                RefreshOutcome::Rejected(msg)
            }
            Err(e) => RefreshOutcome::Failed(e.to_string()),
        }
    }
}
