//! KV-backed token store
//!
//! One hash per account at `oauth-tokens:{lowercase-email}`. An in-process
//! cache fronts the full-pool read for five minutes; every write invalidates
//! it, and a failed reload keeps serving the stale cache (a stale read is
//! preferable to an empty pool).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kvstore::{KvStore, scan_all};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credential::Credential;
use crate::error::Result;

const KEY_PREFIX: &str = "oauth-tokens:";
const CACHE_TTL: Duration = Duration::from_secs(300);

struct CachedPool {
    map: HashMap<String, Credential>,
    loaded_at: Instant,
}

/// Thread-safe credential store over the shared KV backend.
pub struct TokenStore {
    kv: Arc<dyn KvStore>,
    cache: Mutex<Option<CachedPool>>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cache: Mutex::new(None),
        }
    }

    fn key(email: &str) -> String {
        format!("{KEY_PREFIX}{}", email.to_lowercase())
    }

    /// Load every credential, keyed by lowercase email.
    ///
    /// Serves the in-process cache when fresh. On a KV failure the stale
    /// cache (if any) is returned instead of surfacing the error.
    pub async fn load_all(&self) -> Result<HashMap<String, Credential>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.loaded_at.elapsed() < CACHE_TTL
        {
            return Ok(cached.map.clone());
        }

        match self.load_all_uncached().await {
            Ok(map) => {
                *cache = Some(CachedPool {
                    map: map.clone(),
                    loaded_at: Instant::now(),
                });
                Ok(map)
            }
            Err(e) => match cache.as_ref() {
                Some(stale) => {
                    warn!(error = %e, "credential reload failed, serving stale cache");
                    Ok(stale.map.clone())
                }
                None => Err(e),
            },
        }
    }

    async fn load_all_uncached(&self) -> Result<HashMap<String, Credential>> {
        let keys = scan_all(self.kv.as_ref(), &format!("{KEY_PREFIX}*")).await?;
        let mut map = HashMap::new();
        for key in keys {
            let fields = self.kv.hget_all(&key).await?;
            if fields.is_empty() {
                continue;
            }
            match Credential::from_fields(&fields) {
                Ok(cred) => {
                    map.insert(cred.email.clone(), cred);
                }
                Err(e) => warn!(key, error = %e, "skipping unparseable credential"),
            }
        }
        debug!(accounts = map.len(), "loaded credentials");
        Ok(map)
    }

    /// Load one credential, consulting the cache first.
    pub async fn load(&self, email: &str) -> Result<Option<Credential>> {
        let email = email.to_lowercase();
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref()
                && cached.loaded_at.elapsed() < CACHE_TTL
            {
                return Ok(cached.map.get(&email).cloned());
            }
        }
        let fields = self.kv.hget_all(&Self::key(&email)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credential::from_fields(&fields)?))
    }

    /// Persist a credential.
    ///
    /// With `preserve_metadata`, the prior record's `client` and `projects`
    /// are merged in unless overridden, `created_at` is preserved, and the
    /// prior refresh token is retained when the new credential omits one
    /// (Google's refresh responses usually do). `updated_at` is always set
    /// to now and the expiry derived when absent.
    pub async fn save(
        &self,
        email: &str,
        mut credential: Credential,
        preserve_metadata: bool,
    ) -> Result<()> {
        let email = email.to_lowercase();
        credential.email = email.clone();

        if preserve_metadata
            && let Some(prior) = self.load_uncached(&email).await?
        {
            if credential.client.is_none() {
                credential.client = prior.client;
            }
            if credential.projects.is_empty() {
                credential.projects = prior.projects;
            }
            if credential.refresh_token.is_none() {
                credential.refresh_token = prior.refresh_token;
            }
            if prior.created_at != 0 {
                credential.created_at = prior.created_at;
            }
        }

        credential.updated_at = common::unix_secs();
        credential.derive_expiry();

        let key = Self::key(&email);
        // Full rewrite: delete first so optional fields cleared on this
        // credential do not linger from the prior hash.
        self.kv.del(&key).await?;
        self.kv.hset(&key, &credential.to_fields()).await?;
        self.invalidate_cache().await;
        debug!(email, "saved credential");
        Ok(())
    }

    /// Read straight from KV, bypassing the cache (save-path merge source).
    async fn load_uncached(&self, email: &str) -> Result<Option<Credential>> {
        let fields = self.kv.hget_all(&Self::key(email)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credential::from_fields(&fields)?))
    }

    /// Flag a credential as invalid (401 handler). Idempotent; unknown
    /// emails are a no-op.
    pub async fn mark_invalid(&self, email: &str, reason: &str) -> Result<()> {
        let email = email.to_lowercase();
        let key = Self::key(&email);
        let existing = self.kv.hget_all(&key).await?;
        if existing.is_empty() {
            return Ok(());
        }
        self.kv
            .hset(
                &key,
                &[
                    ("invalid".to_string(), "true".to_string()),
                    ("invalid_reason".to_string(), reason.to_string()),
                    (
                        "invalid_at".to_string(),
                        common::unix_secs().to_string(),
                    ),
                ],
            )
            .await?;
        self.invalidate_cache().await;
        info!(email, reason, "credential marked invalid");
        Ok(())
    }

    /// Remove a credential entirely.
    pub async fn delete(&self, email: &str) -> Result<()> {
        self.kv.del(&Self::key(&email.to_lowercase())).await?;
        self.invalidate_cache().await;
        info!(email, "credential deleted");
        Ok(())
    }

    /// Credentials that are not invalid and not expired (with skew).
    pub async fn valid(&self) -> Result<Vec<Credential>> {
        let now = common::unix_secs();
        let mut creds: Vec<Credential> = self
            .load_all()
            .await?
            .into_values()
            .filter(|c| c.is_usable(now))
            .collect();
        creds.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(creds)
    }

    /// Refresh candidates: a refresh token present, not invalid, expiring
    /// within `buffer_ms` of now (absent expiry counts as overdue).
    pub async fn needing_refresh(&self, buffer_ms: u64) -> Result<Vec<Credential>> {
        let now_ms = common::unix_ms();
        let mut creds: Vec<Credential> = self
            .load_all()
            .await?
            .into_values()
            .filter(|c| {
                c.refresh_token.is_some() && !c.invalid && c.expires_within(now_ms, buffer_ms)
            })
            .collect();
        creds.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(creds)
    }

    /// Drop the in-process cache; the next read pays one KV round-trip.
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Age the cache past its TTL without dropping it.
    #[cfg(test)]
    async fn expire_cache(&self) {
        if let Some(cached) = self.cache.lock().await.as_mut() {
            cached.loaded_at = Instant::now() - CACHE_TTL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKv;

    fn test_credential(email: &str, expires_at: u64) -> Credential {
        let now = common::unix_secs();
        let mut cred = Credential::new(email, format!("at_{email}"), 3600, now);
        cred.refresh_token = Some(format!("rt_{email}"));
        cred.expiry_timestamp = Some(expires_at);
        cred
    }

    fn far_future() -> u64 {
        common::unix_secs() + 86_400
    }

    async fn store_with(creds: &[Credential]) -> TokenStore {
        let store = TokenStore::new(Arc::new(MemoryKv::new()));
        for cred in creds {
            store
                .save(&cred.email.clone(), cred.clone(), false)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let cred = test_credential("alice@example.com", far_future());
        let store = store_with(std::slice::from_ref(&cred)).await;

        let loaded = store.load("alice@example.com").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, cred.access_token);
        assert_eq!(loaded.refresh_token, cred.refresh_token);
        assert_eq!(loaded.expiry_timestamp, cred.expiry_timestamp);
        assert_eq!(loaded.created_at, cred.created_at);
    }

    #[tokio::test]
    async fn load_is_case_insensitive() {
        let store = store_with(&[test_credential("alice@example.com", far_future())]).await;
        assert!(store.load("Alice@Example.COM").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let store = store_with(&[]).await;
        assert!(store.load("ghost@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_invalidates_cache() {
        let store = store_with(&[test_credential("a@x.com", far_future())]).await;
        // Warm the cache.
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        store
            .save("b@x.com", test_credential("b@x.com", far_future()), false)
            .await
            .unwrap();

        // The very next read reflects the write.
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.load("b@x.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn preserve_metadata_merges_prior_fields() {
        let mut original = test_credential("a@x.com", far_future());
        original.client = Some("gemini-cli".into());
        original.projects = vec![crate::ProjectInfo {
            project_id: "p1".into(),
            name: "P1".into(),
            project_number: None,
            api_enabled: true,
        }];
        let store = store_with(&[original.clone()]).await;

        // A refresh response: new access token, no refresh token, no
        // client/projects.
        let now = common::unix_secs();
        let mut refreshed = Credential::new("a@x.com", "at_new".into(), 3600, now);
        refreshed.expiry_timestamp = None;
        store.save("a@x.com", refreshed, true).await.unwrap();

        let loaded = store.load("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "at_new");
        assert_eq!(loaded.refresh_token, Some("rt_a@x.com".into()));
        assert_eq!(loaded.client, Some("gemini-cli".into()));
        assert_eq!(loaded.projects.len(), 1);
        assert_eq!(loaded.created_at, original.created_at);
        assert!(loaded.expiry_timestamp.is_some());
    }

    #[tokio::test]
    async fn save_without_preserve_overwrites_metadata() {
        let mut original = test_credential("a@x.com", far_future());
        original.client = Some("gemini-cli".into());
        let store = store_with(&[original]).await;

        let fresh = test_credential("a@x.com", far_future());
        store.save("a@x.com", fresh, false).await.unwrap();

        let loaded = store.load("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.client, None);
    }

    #[tokio::test]
    async fn mark_invalid_sets_flags_and_is_idempotent() {
        let store = store_with(&[test_credential("a@x.com", far_future())]).await;

        store.mark_invalid("a@x.com", "401 Unauthorized").await.unwrap();
        store.mark_invalid("a@x.com", "401 Unauthorized").await.unwrap();

        let loaded = store.load("a@x.com").await.unwrap().unwrap();
        assert!(loaded.invalid);
        assert_eq!(loaded.invalid_reason.as_deref(), Some("401 Unauthorized"));
        assert!(loaded.invalid_at.is_some());
    }

    #[tokio::test]
    async fn mark_invalid_unknown_email_is_noop() {
        let store = store_with(&[]).await;
        store.mark_invalid("ghost@x.com", "whatever").await.unwrap();
        assert!(store.load("ghost@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_credential() {
        let store = store_with(&[test_credential("a@x.com", far_future())]).await;
        store.delete("a@x.com").await.unwrap();
        assert!(store.load("a@x.com").await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_filters_invalid_and_expired() {
        let good = test_credential("good@x.com", far_future());
        let expired = test_credential("expired@x.com", common::unix_secs() - 10);
        let mut bad = test_credential("bad@x.com", far_future());
        bad.invalid = true;
        let store = store_with(&[good, expired, bad]).await;

        let valid = store.valid().await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].email, "good@x.com");
    }

    #[tokio::test]
    async fn valid_applies_expiry_skew() {
        // Expires 30s from now: inside the 60s skew window, so unusable.
        let skewed = test_credential("soon@x.com", common::unix_secs() + 30);
        let store = store_with(&[skewed]).await;
        assert!(store.valid().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn needing_refresh_selects_expiring_credentials() {
        let now = common::unix_secs();
        let soon = test_credential("soon@x.com", now + 60);
        let later = test_credential("later@x.com", now + 86_400);
        let mut no_refresh = test_credential("norefresh@x.com", now + 60);
        no_refresh.refresh_token = None;
        let mut invalid = test_credential("invalid@x.com", now + 60);
        invalid.invalid = true;
        let store = store_with(&[soon, later, no_refresh, invalid]).await;

        let needing = store.needing_refresh(300_000).await.unwrap();
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].email, "soon@x.com");
    }

    #[tokio::test]
    async fn stale_cache_preserved_on_reload_failure() {
        use async_trait::async_trait;
        use std::collections::HashMap as Map;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        /// Delegates to an inner MemoryKv until tripped, then fails reads.
        struct FlakyKv {
            inner: MemoryKv,
            broken: AtomicBool,
        }

        #[async_trait]
        impl KvStore for FlakyKv {
            async fn get(&self, key: &str) -> kvstore::Result<Option<Vec<u8>>> {
                self.inner.get(key).await
            }
            async fn set(
                &self,
                key: &str,
                value: &[u8],
                ttl: Option<Duration>,
            ) -> kvstore::Result<()> {
                self.inner.set(key, value, ttl).await
            }
            async fn hset(&self, key: &str, fields: &[(String, String)]) -> kvstore::Result<()> {
                self.inner.hset(key, fields).await
            }
            async fn hget_all(&self, key: &str) -> kvstore::Result<Map<String, String>> {
                if self.broken.load(Ordering::SeqCst) {
                    return Err(kvstore::Error::Unavailable("connection refused".into()));
                }
                self.inner.hget_all(key).await
            }
            async fn del(&self, key: &str) -> kvstore::Result<()> {
                self.inner.del(key).await
            }
            async fn scan(
                &self,
                cursor: u64,
                pattern: &str,
                count: usize,
            ) -> kvstore::Result<(u64, Vec<String>)> {
                if self.broken.load(Ordering::SeqCst) {
                    return Err(kvstore::Error::Unavailable("connection refused".into()));
                }
                self.inner.scan(cursor, pattern, count).await
            }
        }

        let kv = Arc::new(FlakyKv {
            inner: MemoryKv::new(),
            broken: AtomicBool::new(false),
        });
        let store = TokenStore::new(kv.clone());
        store
            .save("a@x.com", test_credential("a@x.com", far_future()), false)
            .await
            .unwrap();

        // Warm the cache, then break the backend and age the cache past its
        // TTL: the failed reload serves the stale snapshot.
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        kv.broken.store(true, Ordering::SeqCst);
        store.expire_cache().await;
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        // With no cache at all the failure surfaces.
        store.invalidate_cache().await;
        assert!(store.load_all().await.is_err());
    }
}
