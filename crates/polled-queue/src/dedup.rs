//! Advisory duplicate suppression for named messages.
//!
//! Before a named message is pushed its fully-qualified key is checked
//! against a [`DedupStore`]. The check is not transactional: two producers
//! racing on the same key may both push.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "dedup_tests.rs"]
mod tests;

/// Default time a key is remembered
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Existence store used to suppress duplicate submissions
///
/// `exists` has check-and-mark semantics: a key that was not present is
/// recorded and `false` is returned; a present key returns `true`.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn exists(&self, key: &str) -> bool;
}

/// Derive the constant-length key for a message name within a queue and task
pub fn dedup_key(queue: &str, task_name: &str, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update([0u8]);
    hasher.update(task_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());

    let digest = hex::encode(hasher.finalize());
    format!("pq:{}", &digest[..32])
}

/// Process-local dedup store with expiring keys
///
/// # Example
///
/// ```rust
/// use polled_queue::{dedup_key, DedupStore, InMemoryDedupStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryDedupStore::default();
/// let key = dedup_key("emails", "welcome", "user-7");
///
/// assert!(!store.exists(&key).await);
/// assert!(store.exists(&key).await);
/// # });
/// ```
pub struct InMemoryDedupStore {
    ttl: chrono::Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryDedupStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.lock().values().filter(|expires| **expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn exists(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.lock();

        // Expired entries are pruned lazily on each check
        seen.retain(|_, expires| *expires > now);

        if seen.contains_key(key) {
            debug!(key = %key, "Dedup key already present");
            return true;
        }

        let expires = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        seen.insert(key.to_string(), expires);
        false
    }
}
