//! Health-scored project selection
//!
//! Scores every API-enabled project across all owner accounts and picks the
//! best. The score in [0, 1] combines success rate (0.5), a recency bonus
//! favoring projects used within the last five minutes (0.3), and a cooldown
//! penalty (0.2). Cooldown lowers the score but does not exclude a project:
//! when every candidate is cooling down, the least-bad one still serves, and
//! the pool only reports empty when no API-enabled project has a usable
//! owner credential.
//!
//! A single-slot memoization keyed on the call source short-circuits the
//! scan for one second. Best-effort by design: stale reads under concurrency
//! cost at most one extra selection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use gemini_auth::TokenStore;
use selection::{ErrorKind, ProjectSelector, Selection, SelectorStats};
use tracing::debug;

use crate::error::Result;
use crate::state::ProjectStateStore;

const MEMO_TTL: Duration = Duration::from_secs(1);
const RECENCY_WINDOW_MS: f64 = 300_000.0;
const WEIGHT_SUCCESS_RATE: f64 = 0.5;
const WEIGHT_RECENCY: f64 = 0.3;
const WEIGHT_COOLDOWN: f64 = 0.2;

struct Memo {
    source: String,
    selection: Selection,
    at: Instant,
}

/// Selector over the cross-account project pool.
pub struct HealthSelector {
    tokens: Arc<TokenStore>,
    states: Arc<ProjectStateStore>,
    memo: Mutex<Option<Memo>>,
}

impl HealthSelector {
    pub fn new(tokens: Arc<TokenStore>, states: Arc<ProjectStateStore>) -> Self {
        Self {
            tokens,
            states,
            memo: Mutex::new(None),
        }
    }

    /// Pick the healthiest project for a request.
    ///
    /// Returns `None` only when no API-enabled project with a usable owner
    /// credential exists.
    pub async fn select_for_request(&self, call_source: Option<&str>) -> Result<Option<Selection>> {
        let source = call_source.unwrap_or("default");

        if let Some(memoized) = self.memo_lookup(source) {
            return Ok(Some(memoized));
        }

        let creds = self.tokens.valid().await?;
        let mut candidates: Vec<(String, Selection)> = Vec::new();
        for cred in &creds {
            for project in cred.enabled_projects() {
                candidates.push((
                    project.project_id.clone(),
                    Selection {
                        project_id: project.project_id.clone(),
                        owner_email: cred.email.clone(),
                        access_token: cred.access_token.clone(),
                        health_score: 0.0,
                    },
                ));
            }
        }
        if candidates.is_empty() {
            debug!(source, "no eligible projects");
            return Ok(None);
        }

        let states = self.states.load_all().await?;
        let now = common::unix_ms();
        let mut scored: Vec<Selection> = candidates
            .into_iter()
            .map(|(project_id, mut sel)| {
                let (success_rate, recency, cooled) = match states.get(&project_id) {
                    Some(st) => {
                        let total = st.success_count + st.error_count;
                        let rate = if total == 0 {
                            1.0
                        } else {
                            st.success_count as f64 / total as f64
                        };
                        let recency =
                            (1.0 - (now.saturating_sub(st.last_used_at)) as f64 / RECENCY_WINDOW_MS)
                                .max(0.0);
                        (rate, recency, st.in_cooldown(now))
                    }
                    // Never touched: perfect rate, no recency, no cooldown.
                    None => (1.0, 0.0, false),
                };
                let penalty = if cooled { 1.0 } else { 0.0 };
                sel.health_score = (WEIGHT_SUCCESS_RATE * success_rate
                    + WEIGHT_RECENCY * recency
                    + WEIGHT_COOLDOWN * (1.0 - penalty))
                    .clamp(0.0, 1.0);
                sel
            })
            .collect();

        scored.sort_by(|a, b| {
            b.health_score
                .partial_cmp(&a.health_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        let best = scored.remove(0);
        debug!(
            source,
            project_id = %best.project_id,
            score = best.health_score,
            "selected project"
        );

        self.memo_store(source, best.clone());
        Ok(Some(best))
    }

    /// Record a successful use and drop a matching memoized selection.
    pub async fn mark_used(&self, project_id: &str) -> Result<()> {
        self.states.record_success(project_id).await?;
        self.memo_clear_if(project_id);
        Ok(())
    }

    /// Re-open a project immediately and drop a matching memoized selection.
    pub async fn clear_cooldown(&self, project_id: &str) -> Result<()> {
        self.states.clear_cooldown(project_id).await?;
        self.memo_clear_if(project_id);
        Ok(())
    }

    /// Drop any memoized selection (token refresh events).
    pub fn invalidate_memo(&self) {
        *self.memo.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Pool occupancy over the currently eligible projects.
    pub async fn stats(&self) -> Result<SelectorStats> {
        let creds = self.tokens.valid().await?;
        let states = self.states.load_all().await?;
        let now = common::unix_ms();
        let mut total = 0usize;
        let mut cooled = 0usize;
        for cred in &creds {
            for project in cred.enabled_projects() {
                total += 1;
                if states
                    .get(&project.project_id)
                    .is_some_and(|st| st.in_cooldown(now))
                {
                    cooled += 1;
                }
            }
        }
        Ok(SelectorStats {
            available: total - cooled,
            in_cooldown: cooled,
            total,
        })
    }

    fn memo_lookup(&self, source: &str) -> Option<Selection> {
        let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        memo.as_ref()
            .filter(|m| m.source == source && m.at.elapsed() < MEMO_TTL)
            .map(|m| m.selection.clone())
    }

    fn memo_store(&self, source: &str, selection: Selection) {
        *self.memo.lock().unwrap_or_else(|e| e.into_inner()) = Some(Memo {
            source: source.to_string(),
            selection,
            at: Instant::now(),
        });
    }

    fn memo_clear_if(&self, project_id: &str) {
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        if memo
            .as_ref()
            .is_some_and(|m| m.selection.project_id == project_id)
        {
            *memo = None;
        }
    }
}

impl ProjectSelector for HealthSelector {
    fn select_for_request<'a>(
        &'a self,
        call_source: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = selection::Result<Option<Selection>>> + Send + 'a>> {
        Box::pin(async move {
            HealthSelector::select_for_request(self, call_source)
                .await
                .map_err(|e| selection::Error::Store(e.to_string()))
        })
    }

    fn mark_used<'a>(
        &'a self,
        project_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = selection::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            HealthSelector::mark_used(self, project_id)
                .await
                .map_err(|e| selection::Error::Store(e.to_string()))
        })
    }

    fn mark_cooldown<'a>(
        &'a self,
        project_id: &'a str,
        duration_ms: u64,
    ) -> Pin<Box<dyn Future<Output = selection::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.states
                .mark_cooldown(project_id, duration_ms)
                .await
                .map(|_| ())
                .map_err(|e| selection::Error::Store(e.to_string()))
        })
    }

    fn record_error<'a>(
        &'a self,
        project_id: &'a str,
        kind: ErrorKind,
        quota_reset_time_ms: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = selection::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.states
                .record_error(project_id, kind, quota_reset_time_ms)
                .await
                .map(|_| ())
                .map_err(|e| selection::Error::Store(e.to_string()))
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = selection::Result<SelectorStats>> + Send + '_>> {
        Box::pin(async move {
            HealthSelector::stats(self)
                .await
                .map_err(|e| selection::Error::Store(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_auth::{Credential, ProjectInfo};
    use kvstore::MemoryKv;

    async fn setup(projects: &[(&str, bool)]) -> (HealthSelector, Arc<ProjectStateStore>) {
        let kv = Arc::new(MemoryKv::new());
        let tokens = Arc::new(TokenStore::new(kv.clone()));
        let states = Arc::new(ProjectStateStore::new(kv));

        let now = common::unix_secs();
        let mut cred = Credential::new("owner@example.com", "at_owner".into(), 86_400, now);
        cred.projects = projects
            .iter()
            .map(|(id, enabled)| ProjectInfo {
                project_id: id.to_string(),
                name: id.to_string(),
                project_number: None,
                api_enabled: *enabled,
            })
            .collect();
        tokens.save("owner@example.com", cred, false).await.unwrap();

        (
            HealthSelector::new(tokens, states.clone()),
            states,
        )
    }

    #[tokio::test]
    async fn selects_some_project_when_pool_is_healthy() {
        let (selector, _) = setup(&[("p-a", true), ("p-b", true)]).await;
        let sel = selector.select_for_request(None).await.unwrap().unwrap();
        assert!(sel.project_id == "p-a" || sel.project_id == "p-b");
        assert_eq!(sel.owner_email, "owner@example.com");
        assert_eq!(sel.access_token, "at_owner");
        assert!(sel.health_score > 0.0 && sel.health_score <= 1.0);
    }

    #[tokio::test]
    async fn tie_break_is_lexicographic() {
        let (selector, _) = setup(&[("p-b", true), ("p-a", true), ("p-c", true)]).await;
        let sel = selector.select_for_request(None).await.unwrap().unwrap();
        assert_eq!(sel.project_id, "p-a");
    }

    #[tokio::test]
    async fn error_history_demotes_a_project() {
        let (selector, states) = setup(&[("p-a", true), ("p-b", true)]).await;
        states
            .record_error("p-a", ErrorKind::Server, None)
            .await
            .unwrap();
        let sel = selector.select_for_request(None).await.unwrap().unwrap();
        assert_eq!(sel.project_id, "p-b");
    }

    #[tokio::test]
    async fn recently_used_project_gets_recency_bonus() {
        // Scoring as written favors the recently used project over an
        // untouched one when success rates are equal.
        let (selector, states) = setup(&[("p-a", true), ("p-b", true)]).await;
        states.record_success("p-b").await.unwrap();
        let sel = selector.select_for_request(None).await.unwrap().unwrap();
        assert_eq!(sel.project_id, "p-b");
        assert!(sel.health_score > 0.9);
    }

    #[tokio::test]
    async fn cooled_project_still_serves_when_alone() {
        let (selector, states) = setup(&[("p-only", true)]).await;
        states
            .record_error("p-only", ErrorKind::Server, None)
            .await
            .unwrap();
        selector.invalidate_memo();
        let sel = selector.select_for_request(None).await.unwrap().unwrap();
        assert_eq!(sel.project_id, "p-only");
        // Failed once, in cooldown, never a success: bottom score.
        assert!(sel.health_score < 0.1);
    }

    #[tokio::test]
    async fn disabled_projects_are_not_eligible() {
        let (selector, _) = setup(&[("p-off", false)]).await;
        assert!(selector.select_for_request(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_credential_empties_the_pool() {
        let kv = Arc::new(MemoryKv::new());
        let tokens = Arc::new(TokenStore::new(kv.clone()));
        let states = Arc::new(ProjectStateStore::new(kv));
        let now = common::unix_secs();
        let mut cred = Credential::new("owner@x.com", "at".into(), 86_400, now);
        cred.invalid = true;
        cred.projects = vec![ProjectInfo {
            project_id: "p1".into(),
            name: "p1".into(),
            project_number: None,
            api_enabled: true,
        }];
        tokens.save("owner@x.com", cred, false).await.unwrap();

        let selector = HealthSelector::new(tokens, states);
        assert!(selector.select_for_request(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memoization_skips_rescan_within_window() {
        let (selector, states) = setup(&[("p-a", true), ("p-b", true)]).await;
        let first = selector
            .select_for_request(Some("cli"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.project_id, "p-a");

        // Wreck p-a's score behind the memo's back.
        for _ in 0..5 {
            states
                .record_error("p-a", ErrorKind::Server, None)
                .await
                .unwrap();
        }

        // Within the window and same source: memoized answer.
        let second = selector
            .select_for_request(Some("cli"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.project_id, "p-a");

        // After invalidation the rescan sees the errors.
        selector.invalidate_memo();
        let third = selector
            .select_for_request(Some("cli"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.project_id, "p-b");
    }

    #[tokio::test]
    async fn different_call_source_bypasses_memo() {
        let (selector, states) = setup(&[("p-a", true), ("p-b", true)]).await;
        let first = selector
            .select_for_request(Some("cli"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.project_id, "p-a");

        for _ in 0..5 {
            states
                .record_error("p-a", ErrorKind::Server, None)
                .await
                .unwrap();
        }

        let other = selector
            .select_for_request(Some("web"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.project_id, "p-b");
    }

    #[tokio::test]
    async fn mark_used_records_success_and_clears_memo() {
        let (selector, states) = setup(&[("p-a", true)]).await;
        selector.select_for_request(Some("cli")).await.unwrap();

        selector.mark_used("p-a").await.unwrap();
        selector.mark_used("p-a").await.unwrap();

        // Two marks, two success increments.
        let state = states.get("p-a").await.unwrap().unwrap();
        assert_eq!(state.success_count, 2);
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn clear_cooldown_reopens_project() {
        let (selector, states) = setup(&[("p-a", true)]).await;
        states
            .record_error("p-a", ErrorKind::QuotaExhausted, Some(common::unix_ms() + 3_600_000))
            .await
            .unwrap();
        assert!(states.in_cooldown("p-a").await.unwrap());

        selector.clear_cooldown("p-a").await.unwrap();
        assert!(!states.in_cooldown("p-a").await.unwrap());
    }

    #[tokio::test]
    async fn stats_counts_cooldown_occupancy() {
        let (selector, states) = setup(&[("p-a", true), ("p-b", true), ("p-off", false)]).await;
        states
            .record_error("p-a", ErrorKind::Server, None)
            .await
            .unwrap();

        let stats = HealthSelector::stats(&selector).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_cooldown, 1);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn works_through_the_trait_object() {
        let (selector, _) = setup(&[("p-a", true)]).await;
        let dyn_selector: Arc<dyn ProjectSelector> = Arc::new(selector);
        let sel = dyn_selector
            .select_for_request(None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sel.project_id, "p-a");
        dyn_selector.mark_used("p-a").await.unwrap();
        dyn_selector
            .record_error("p-a", ErrorKind::RateLimit, None)
            .await
            .unwrap();
        dyn_selector.mark_cooldown("p-a", 15_000).await.unwrap();
        let stats = dyn_selector.stats().await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
