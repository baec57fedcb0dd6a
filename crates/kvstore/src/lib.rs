//! Key-value backend abstraction for gateway state
//!
//! All persisted gateway state — credential hashes, project-state blobs,
//! daily metric records — lives behind the `KvStore` trait. Values are
//! opaque; consumers serialize. TTLs are honored per-key. `scan` is
//! non-snapshot and may return duplicate keys across cursor pages, so
//! consumers go through [`scan_all`], which dedupes.
//!
//! The store is not transactional: compound load-modify-save sequences are
//! last-write-wins, and callers that need monotonicity (cooldown timestamps)
//! must merge with `max(existing, new)` before saving.

mod memory;

pub use memory::MemoryKv;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Errors from KV operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("wrong value type for key: {0}")]
    WrongType(String),
}

/// Result alias for KV operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed get/set/hget/hset/scan with per-key TTL.
///
/// Implementations serialize their own operations; hash fields are
/// string-valued (consumers stringify numerics and booleans).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a plain value. `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a plain value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Merge fields into a hash, creating it if absent.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Fetch all fields of a hash. Empty map when absent or expired.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn del(&self, key: &str) -> Result<()>;

    /// Cursor-based key scan with a redis-style `*` glob pattern.
    ///
    /// Returns `(next_cursor, keys)`; a next cursor of 0 ends the scan.
    /// Not a snapshot: keys written mid-scan may appear, and a key may be
    /// returned more than once.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;
}

/// Drain a full scan, deduplicating keys across cursor pages.
pub async fn scan_all(store: &dyn KvStore, pattern: &str) -> Result<Vec<String>> {
    let mut cursor = 0u64;
    let mut seen = std::collections::HashSet::new();
    let mut keys = Vec::new();
    loop {
        let (next, page) = store.scan(cursor, pattern, 100).await?;
        for key in page {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(keys)
}
