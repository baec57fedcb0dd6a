//! In-memory KV backend
//!
//! Sorted map behind a `tokio::sync::RwLock`. Entries expire lazily: reads
//! treat an expired entry as absent, and scans purge expired entries before
//! paging. Clones share state, so one backend can be handed to every store.
//!
//! The scan cursor is an offset into the sorted key space, which makes the
//! scan non-snapshot: keys inserted mid-scan can shift later pages and a key
//! may be returned twice. Consumers dedupe (see `scan_all`).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Error, KvStore, Result};

#[derive(Debug, Clone)]
enum Value {
    Blob(Vec<u8>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory `KvStore` backend.
#[derive(Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if entry.expired(Instant::now()) => Ok(None),
            Some(Entry {
                value: Value::Blob(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(Entry {
                value: Value::Hash(_),
                ..
            }) => Err(Error::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Blob(value.to_vec()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        match data.get_mut(key) {
            Some(entry) if entry.expired(now) => {
                let mut map = HashMap::new();
                map.extend(fields.iter().cloned());
                *entry = Entry {
                    value: Value::Hash(map),
                    expires_at: None,
                };
                Ok(())
            }
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => {
                map.extend(fields.iter().cloned());
                Ok(())
            }
            Some(Entry {
                value: Value::Blob(_),
                ..
            }) => Err(Error::WrongType(key.to_string())),
            None => {
                let mut map = HashMap::new();
                map.extend(fields.iter().cloned());
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(map),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) if entry.expired(Instant::now()) => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => Ok(map.clone()),
            Some(Entry {
                value: Value::Blob(_),
                ..
            }) => Err(Error::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        data.retain(|_, entry| !entry.expired(now));

        let matching: Vec<&String> = data
            .keys()
            .filter(|k| glob_match(pattern, k))
            .collect();

        let start = cursor as usize;
        if start >= matching.len() {
            return Ok((0, Vec::new()));
        }
        let end = (start + count.max(1)).min(matching.len());
        let page: Vec<String> = matching[start..end].iter().map(|k| (*k).clone()).collect();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, page))
    }
}

/// Redis-style glob match supporting only `*` wildcards.
fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with `*`, anything left in `rest` is covered.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("k", b"hello", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn set_overwrites() {
        let kv = MemoryKv::new();
        kv.set("k", b"v1", None).await.unwrap();
        kv.set("k", b"v2", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn ttl_expires_value() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(kv.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_dropped_from_scan() {
        let kv = MemoryKv::new();
        kv.set("a", b"v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        kv.set("b", b"v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, keys) = kv.scan(0, "*", 10).await.unwrap();
        assert_eq!(keys, vec!["b"]);
    }

    #[tokio::test]
    async fn hset_and_hget_all() {
        let kv = MemoryKv::new();
        kv.hset(
            "h",
            &[
                ("email".into(), "a@b.c".into()),
                ("invalid".into(), "false".into()),
            ],
        )
        .await
        .unwrap();
        let map = kv.hget_all("h").await.unwrap();
        assert_eq!(map.get("email").unwrap(), "a@b.c");
        assert_eq!(map.get("invalid").unwrap(), "false");
    }

    #[tokio::test]
    async fn hset_merges_fields() {
        let kv = MemoryKv::new();
        kv.hset("h", &[("a".into(), "1".into())]).await.unwrap();
        kv.hset("h", &[("b".into(), "2".into())]).await.unwrap();
        let map = kv.hget_all("h").await.unwrap();
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn hget_all_missing_is_empty() {
        let kv = MemoryKv::new();
        assert!(kv.hget_all("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_type_errors() {
        let kv = MemoryKv::new();
        kv.set("s", b"v", None).await.unwrap();
        assert!(matches!(
            kv.hget_all("s").await,
            Err(Error::WrongType(_))
        ));
        kv.hset("h", &[("f".into(), "v".into())]).await.unwrap();
        assert!(matches!(kv.get("h").await, Err(Error::WrongType(_))));
    }

    #[tokio::test]
    async fn del_removes_key() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", None).await.unwrap();
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        // Deleting again is a no-op.
        kv.del("k").await.unwrap();
    }

    #[tokio::test]
    async fn scan_pages_through_matches() {
        let kv = MemoryKv::new();
        for i in 0..7 {
            kv.set(&format!("oauth-tokens:user{i}@x.com"), b"v", None)
                .await
                .unwrap();
        }
        kv.set("project-state:p1", b"v", None).await.unwrap();

        let mut cursor = 0;
        let mut all = Vec::new();
        loop {
            let (next, page) = kv.scan(cursor, "oauth-tokens:*", 3).await.unwrap();
            all.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(all.len(), 7);
        assert!(all.iter().all(|k| k.starts_with("oauth-tokens:")));
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let kv = MemoryKv::new();
        let clone = kv.clone();
        kv.set("k", b"v", None).await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn glob_exact() {
        assert!(glob_match("abc", "abc"));
        assert!(!glob_match("abc", "abd"));
    }

    #[test]
    fn glob_prefix() {
        assert!(glob_match("metrics:*", "metrics:2025-01-01"));
        assert!(!glob_match("metrics:*", "project-state:p1"));
    }

    #[test]
    fn glob_suffix_and_middle() {
        assert!(glob_match("*@gmail.com", "oauth:a@gmail.com"));
        assert!(glob_match("oauth-*:a", "oauth-tokens:a"));
        assert!(!glob_match("oauth-*:b", "oauth-tokens:a"));
    }

    #[test]
    fn glob_bare_star() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
    }
}
