//! Per-project health state and cooldown computation
//!
//! One JSON blob per project at `project-state:{id}`, lazily created with
//! zeroed counters on first reference and never destroyed (retained for
//! historical introspection). A 30-second in-process cache fronts the full
//! map; every write invalidates it.
//!
//! Cooldown rules: the Nth consecutive error cools the project for
//! `min(1h, 60s * 2^(N-3))` (60s below the threshold of 3). A not-logged-in
//! error caps the cooldown at the initial duration since re-authentication
//! resolves it. A quota-exhausted error stretches the cooldown to the quota
//! reset time. `record_error` persists `max(existing, new)` so racing error
//! records never shrink a cooldown; the verdict-driven `mark_cooldown`
//! overwrites, because the classifier's reset duration is authoritative for
//! that response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvstore::{KvStore, scan_all};
use selection::ErrorKind;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Cooldown on the first errors of a streak.
pub const INITIAL_COOLDOWN_MS: u64 = 60_000;
/// Upper bound for any computed cooldown.
pub const MAX_COOLDOWN_MS: u64 = 3_600_000;
/// Streak length at which the exponential curve starts.
pub const COOLDOWN_THRESHOLD: u32 = 3;

const KEY_PREFIX: &str = "project-state:";
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Health counters and cooldown bookkeeping for one project.
///
/// Timestamps are unix milliseconds; zero means "never".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub last_used_at: u64,
    #[serde(default)]
    pub last_success_at: u64,
    #[serde(default)]
    pub last_error_at: u64,
    #[serde(default)]
    pub cooldown_until: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_reset_reason: Option<String>,
}

impl ProjectState {
    fn fresh(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Default::default()
        }
    }

    /// In cooldown iff now is before the later of the cooldown end and the
    /// quota reset time.
    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        now_ms < self.cooldown_until.max(self.quota_reset_time.unwrap_or(0))
    }
}

/// Partial update for `ProjectStateStore::update`; `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct ProjectStatePatch {
    pub success_count: Option<u64>,
    pub error_count: Option<u64>,
    pub consecutive_errors: Option<u32>,
    pub last_used_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub last_error_at: Option<u64>,
    pub cooldown_until: Option<u64>,
    pub quota_reset_time: Option<Option<u64>>,
    pub last_error_kind: Option<Option<ErrorKind>>,
    pub quota_reset_reason: Option<Option<String>>,
}

/// KV-backed store of per-project health state.
pub struct ProjectStateStore {
    kv: Arc<dyn KvStore>,
    cache: Mutex<Option<(HashMap<String, ProjectState>, Instant)>>,
}

impl ProjectStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cache: Mutex::new(None),
        }
    }

    fn key(project_id: &str) -> String {
        format!("{KEY_PREFIX}{project_id}")
    }

    /// All known project states, via the 30-second cache.
    pub async fn load_all(&self) -> Result<HashMap<String, ProjectState>> {
        let mut cache = self.cache.lock().await;
        if let Some((map, loaded_at)) = cache.as_ref()
            && loaded_at.elapsed() < CACHE_TTL
        {
            return Ok(map.clone());
        }

        let keys = scan_all(self.kv.as_ref(), &format!("{KEY_PREFIX}*")).await?;
        let mut map = HashMap::new();
        for key in keys {
            if let Some(bytes) = self.kv.get(&key).await? {
                let state: ProjectState = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Parse(format!("project state {key}: {e}")))?;
                map.insert(state.project_id.clone(), state);
            }
        }
        *cache = Some((map.clone(), Instant::now()));
        Ok(map)
    }

    /// State for one project, if it has ever been touched.
    pub async fn get(&self, project_id: &str) -> Result<Option<ProjectState>> {
        Ok(self.load_all().await?.get(project_id).cloned())
    }

    /// State for one project, zeroed defaults when never touched.
    pub async fn get_or_default(&self, project_id: &str) -> Result<ProjectState> {
        Ok(self
            .load_all()
            .await?
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| ProjectState::fresh(project_id)))
    }

    async fn save(&self, state: &ProjectState) -> Result<()> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| Error::Parse(format!("serializing project state: {e}")))?;
        self.kv
            .set(&Self::key(&state.project_id), &bytes, None)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Merge non-nil patch fields; the keyed project id always wins.
    pub async fn update(&self, project_id: &str, patch: ProjectStatePatch) -> Result<ProjectState> {
        let mut state = self.get_or_default(project_id).await?;
        state.project_id = project_id.to_string();
        if let Some(v) = patch.success_count {
            state.success_count = v;
        }
        if let Some(v) = patch.error_count {
            state.error_count = v;
        }
        if let Some(v) = patch.consecutive_errors {
            state.consecutive_errors = v;
        }
        if let Some(v) = patch.last_used_at {
            state.last_used_at = v;
        }
        if let Some(v) = patch.last_success_at {
            state.last_success_at = v;
        }
        if let Some(v) = patch.last_error_at {
            state.last_error_at = v;
        }
        if let Some(v) = patch.cooldown_until {
            state.cooldown_until = v;
        }
        if let Some(v) = patch.quota_reset_time {
            state.quota_reset_time = v;
        }
        if let Some(v) = patch.last_error_kind {
            state.last_error_kind = v;
        }
        if let Some(v) = patch.quota_reset_reason {
            state.quota_reset_reason = v;
        }
        self.save(&state).await?;
        Ok(state)
    }

    /// Record a successful use: bumps the success counter, stamps last-used
    /// and last-success, resets the error streak. The cooldown timestamp is
    /// left as-is (it may already be in the past, which re-opens the
    /// project).
    pub async fn record_success(&self, project_id: &str) -> Result<ProjectState> {
        let now = common::unix_ms();
        let mut state = self.get_or_default(project_id).await?;
        state.success_count += 1;
        state.last_used_at = now;
        state.last_success_at = now;
        state.consecutive_errors = 0;
        state.last_error_kind = None;
        self.save(&state).await?;
        debug!(project_id, successes = state.success_count, "recorded success");
        Ok(state)
    }

    /// Record a failed use and grow the cooldown.
    ///
    /// The new cooldown never shrinks the existing one; a quota reset time
    /// extends it further and is remembered with a human-readable reason.
    pub async fn record_error(
        &self,
        project_id: &str,
        kind: ErrorKind,
        quota_reset_time_ms: Option<u64>,
    ) -> Result<ProjectState> {
        let now = common::unix_ms();
        let mut state = self.get_or_default(project_id).await?;
        state.error_count += 1;
        state.consecutive_errors += 1;
        state.last_error_at = now;
        state.last_error_kind = Some(kind);

        let duration = cooldown_duration_ms(state.consecutive_errors, kind);
        state.cooldown_until = state.cooldown_until.max(now + duration);

        if kind == ErrorKind::QuotaExhausted
            && let Some(reset) = quota_reset_time_ms
        {
            state.cooldown_until = state.cooldown_until.max(reset);
            state.quota_reset_time = Some(reset);
            state.quota_reset_reason = Some(format_duration_ms(reset.saturating_sub(now)));
        }

        self.save(&state).await?;
        info!(
            project_id,
            kind = kind.as_str(),
            consecutive = state.consecutive_errors,
            cooldown_ms = state.cooldown_until.saturating_sub(now),
            "recorded error"
        );
        Ok(state)
    }

    /// Overwrite the cooldown with `now + duration_ms` (classifier verdict).
    pub async fn mark_cooldown(&self, project_id: &str, duration_ms: u64) -> Result<ProjectState> {
        let now = common::unix_ms();
        let mut state = self.get_or_default(project_id).await?;
        state.cooldown_until = now + duration_ms;
        self.save(&state).await?;
        debug!(project_id, duration_ms, "cooldown set");
        Ok(state)
    }

    /// Zero the cooldown and error streak, clear quota bookkeeping.
    pub async fn clear_cooldown(&self, project_id: &str) -> Result<ProjectState> {
        let mut state = self.get_or_default(project_id).await?;
        state.cooldown_until = 0;
        state.consecutive_errors = 0;
        state.quota_reset_time = None;
        state.quota_reset_reason = None;
        state.last_error_kind = None;
        self.save(&state).await?;
        info!(project_id, "cooldown cleared");
        Ok(state)
    }

    /// Whether the project is currently cooling down.
    pub async fn in_cooldown(&self, project_id: &str) -> Result<bool> {
        Ok(self
            .get_or_default(project_id)
            .await?
            .in_cooldown(common::unix_ms()))
    }

    /// Projects not in cooldown, least-recently-used first.
    pub async fn available(&self) -> Result<Vec<ProjectState>> {
        let now = common::unix_ms();
        let mut states: Vec<ProjectState> = self
            .load_all()
            .await?
            .into_values()
            .filter(|s| !s.in_cooldown(now))
            .collect();
        states.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        Ok(states)
    }

    /// Projects that last failed on quota or whose quota window has not yet
    /// reset.
    pub async fn quota_exhausted(&self) -> Result<Vec<ProjectState>> {
        let now = common::unix_ms();
        let mut states: Vec<ProjectState> = self
            .load_all()
            .await?
            .into_values()
            .filter(|s| {
                s.last_error_kind == Some(ErrorKind::QuotaExhausted)
                    || s.quota_reset_time.is_some_and(|t| t > now)
            })
            .collect();
        states.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(states)
    }

    /// Drop the in-process cache.
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Age the cache past its TTL without dropping it.
    #[cfg(test)]
    async fn expire_cache(&self) {
        if let Some((_, loaded_at)) = self.cache.lock().await.as_mut() {
            *loaded_at = Instant::now() - CACHE_TTL;
        }
    }
}

/// Cooldown for the Nth consecutive error of a streak.
pub fn cooldown_duration_ms(consecutive_errors: u32, kind: ErrorKind) -> u64 {
    if kind == ErrorKind::NotLoggedIn {
        return INITIAL_COOLDOWN_MS;
    }
    if consecutive_errors < COOLDOWN_THRESHOLD {
        return INITIAL_COOLDOWN_MS;
    }
    let exponent = (consecutive_errors - COOLDOWN_THRESHOLD).min(16);
    MAX_COOLDOWN_MS.min(INITIAL_COOLDOWN_MS * (1u64 << exponent))
}

/// Render a duration as a compact `21h10m20s` style string.
pub fn format_duration_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 || hours > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    out.push_str(&format!("{seconds}s"));
    out
}
