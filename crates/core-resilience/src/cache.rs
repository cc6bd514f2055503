//! Short-TTL caching of expensive checks
//!
//! Validation results are cached with asymmetric lifetimes: successes live
//! longer than failures, because a failure is likely transient and worth
//! re-checking sooner, while re-verifying a success burns a provider round
//! trip for no new information.
//!
//! Invalidation is explicit. After any state change the caller knows about
//! (a refresh, successful or not), the affected entries must be removed;
//! serving a stale result after a known transition is never acceptable.
//!
//! Like the other primitives in this crate, the cache takes `now` as a
//! parameter rather than reading a clock.
//!
//! # Example
//!
//! ```
//! use tether_core_resilience::cache::{CacheConfig, TtlCache};
//! use std::time::Duration;
//! use chrono::Utc;
//!
//! let cache: TtlCache<&str, u32> = TtlCache::new(CacheConfig {
//!     ttl_success: Duration::from_secs(300),
//!     ttl_failure: Duration::from_secs(20),
//! });
//!
//! let now = Utc::now();
//! cache.insert_success(&"check", 42, now);
//! assert_eq!(cache.get(&"check", now), Some(42));
//! cache.invalidate(&"check");
//! assert_eq!(cache.get(&"check", now), None);
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// TTL pair for a cache instance
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Lifetime of entries recording a successful check
    pub ttl_success: Duration,
    /// Lifetime of entries recording a failed check; should be shorter
    pub ttl_failure: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_success: Duration::from_secs(300),
            ttl_failure: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// In-memory TTL cache with success/failure lifetimes.
///
/// Keys should be scoped to everything that identifies the check (in the
/// engine: user, provider, and check type) so results never cross-contaminate.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash + Clone, V: Clone> {
    config: CacheConfig,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create a cache with the given TTL pair
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live entry. Expired entries are removed on access.
    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Cache a successful check result with the long TTL
    pub fn insert_success(&self, key: &K, value: V, now: DateTime<Utc>) {
        self.insert_with_ttl(key, value, self.config.ttl_success, now);
    }

    /// Cache a failed check result with the short TTL
    pub fn insert_failure(&self, key: &K, value: V, now: DateTime<Utc>) {
        self.insert_with_ttl(key, value, self.config.ttl_failure, now);
    }

    /// Cache a value with an explicit lifetime
    pub fn insert_with_ttl(&self, key: &K, value: V, ttl: Duration, now: DateTime<Utc>) {
        let expires_at = now + chrono::Duration::seconds(ttl.as_secs() as i64);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(key.clone(), Entry { value, expires_at });
    }

    /// Remove an entry. Returns true if one was present.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key).is_some()
    }

    /// Look up `key`, computing and caching on miss.
    ///
    /// `compute` reports success via the bool in its output, which selects
    /// the TTL. Returns the value and whether it was served from cache.
    ///
    /// Concurrent callers that miss simultaneously will each compute; the
    /// engine deduplicates the expensive provider path separately, so the
    /// cache does not need request coalescing.
    pub async fn get_or_compute<F, Fut>(&self, key: &K, now: DateTime<Utc>, compute: F) -> (V, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (V, bool)>,
    {
        if let Some(value) = self.get(key, now) {
            return (value, true);
        }

        let (value, success) = compute().await;
        if success {
            self.insert_success(key, value.clone(), now);
        } else {
            self.insert_failure(key, value.clone(), now);
        }
        (value, false)
    }

    /// Drop all expired entries. Returns the number removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Number of entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
