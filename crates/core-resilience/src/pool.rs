//! Keyed client pool with LRU eviction
//!
//! Caches constructed API clients keyed by an opaque fingerprint (in the
//! engine: a digest of the credential the client was built from). Clients
//! are read-mostly and handed out shared; there is no exclusive checkout and
//! no release call. Eviction is pool-driven only: least-recently-used when
//! capacity forces it, staleness-based when [`ClientPool::optimize`] runs.
//!
//! # Example
//!
//! ```no_run
//! use tether_core_resilience::pool::{ClientPool, PoolConfig};
//! use tether_core_resilience::error::ResilienceError;
//! use chrono::Utc;
//!
//! # #[derive(Clone)]
//! # struct ApiClient;
//! # async fn example() -> Result<(), ResilienceError> {
//! let pool: ClientPool<ApiClient> = ClientPool::new(PoolConfig::default());
//!
//! let client = pool
//!     .acquire_or_create("fingerprint-abc", Utc::now(), || async { Ok(ApiClient) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use super::error::ResilienceError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Configuration for pool capacity and staleness
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of cached clients
    pub max_size: usize,
    /// Entries idle longer than this are removed by `optimize`
    pub idle_eviction: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_eviction: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// A cached client plus its usage metadata
#[derive(Debug, Clone)]
struct PoolEntry<C> {
    client: C,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    usage_count: u64,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Cached clients
    pub size: usize,
    /// Configured capacity
    pub max_size: usize,
    /// Total acquisitions served from cache since creation
    pub hits: u64,
    /// Total clients constructed since creation
    pub misses: u64,
    /// Total entries evicted (LRU + staleness) since creation
    pub evictions: u64,
}

impl PoolStats {
    /// Pool fill level as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.size as f64 / self.max_size as f64) * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded cache of shared API clients keyed by credential fingerprint.
///
/// `C` is expected to be a cheap handle (`Arc<...>` in practice); acquiring
/// clones it rather than transferring ownership.
#[derive(Debug)]
pub struct ClientPool<C: Clone + Send> {
    config: PoolConfig,
    inner: Mutex<(HashMap<String, PoolEntry<C>>, Counters)>,
}

impl<C: Clone + Send> ClientPool<C> {
    /// Create a pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new((HashMap::new(), Counters::default())),
        }
    }

    /// Fetch the client for `fingerprint`, constructing it on miss.
    ///
    /// The construction future runs outside the pool lock, so a slow build
    /// never blocks acquisitions for other fingerprints. If two callers race
    /// on the same missing fingerprint both may construct; the first insert
    /// wins and the loser's client is dropped.
    pub async fn acquire_or_create<F, Fut>(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
        create: F,
    ) -> Result<C, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, ResilienceError>>,
    {
        {
            let mut inner = self.inner.lock().await;
            let (entries, counters) = &mut *inner;
            if let Some(entry) = entries.get_mut(fingerprint) {
                entry.last_used_at = now;
                entry.usage_count += 1;
                counters.hits += 1;
                return Ok(entry.client.clone());
            }
        }

        let client = create().await?;

        let mut inner = self.inner.lock().await;
        let (entries, counters) = &mut *inner;
        if let Some(entry) = entries.get_mut(fingerprint) {
            // Lost the construction race; keep the established entry
            entry.last_used_at = now;
            entry.usage_count += 1;
            counters.hits += 1;
            return Ok(entry.client.clone());
        }

        counters.misses += 1;
        Self::make_room(entries, counters, self.config.max_size)?;
        entries.insert(
            fingerprint.to_string(),
            PoolEntry {
                client: client.clone(),
                created_at: now,
                last_used_at: now,
                usage_count: 1,
            },
        );
        Ok(client)
    }

    /// Insert a pre-built client, evicting LRU if at capacity.
    ///
    /// Returns false if an entry for this fingerprint already existed (the
    /// existing entry is kept).
    pub async fn insert(&self, fingerprint: &str, client: C, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().await;
        let (entries, counters) = &mut *inner;
        if entries.contains_key(fingerprint) {
            return false;
        }
        if Self::make_room(entries, counters, self.config.max_size).is_err() {
            return false;
        }
        entries.insert(
            fingerprint.to_string(),
            PoolEntry {
                client,
                created_at: now,
                last_used_at: now,
                usage_count: 0,
            },
        );
        true
    }

    /// Pre-populate the pool from already-built clients.
    ///
    /// Returns the number of entries actually inserted.
    pub async fn warm_up(&self, clients: Vec<(String, C)>, now: DateTime<Utc>) -> usize {
        let mut inserted = 0;
        for (fingerprint, client) in clients {
            if self.insert(&fingerprint, client, now).await {
                inserted += 1;
            }
        }
        debug!(inserted, "client pool warm-up complete");
        inserted
    }

    /// Drop the entry for `fingerprint` (e.g. after its credential changed).
    pub async fn invalidate(&self, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.0.remove(fingerprint).is_some()
    }

    /// Remove entries idle beyond the staleness threshold, independent of
    /// pool pressure. Returns the number evicted.
    pub async fn optimize(&self, now: DateTime<Utc>) -> usize {
        let idle = chrono::Duration::seconds(self.config.idle_eviction.as_secs() as i64);
        let mut inner = self.inner.lock().await;
        let (entries, counters) = &mut *inner;
        let before = entries.len();
        entries.retain(|_, e| now - e.last_used_at <= idle);
        let evicted = before - entries.len();
        counters.evictions += evicted as u64;
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "evicted stale pool entries");
        }
        evicted
    }

    /// Current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            size: inner.0.len(),
            max_size: self.config.max_size,
            hits: inner.1.hits,
            misses: inner.1.misses,
            evictions: inner.1.evictions,
        }
    }

    /// Usage count for a fingerprint, if pooled
    pub async fn usage_count(&self, fingerprint: &str) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner.0.get(fingerprint).map(|e| e.usage_count)
    }

    /// Evict the least-recently-used entry if the map is at capacity
    fn make_room(
        entries: &mut HashMap<String, PoolEntry<C>>,
        counters: &mut Counters,
        max_size: usize,
    ) -> Result<(), ResilienceError> {
        if max_size == 0 {
            return Err(ResilienceError::PoolExhausted);
        }
        while entries.len() >= max_size {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used_at)
                .map(|(k, _)| k.clone());
            match lru {
                Some(key) => {
                    entries.remove(&key);
                    counters.evictions += 1;
                    debug!(fingerprint = %key, "evicted LRU pool entry");
                }
                None => return Err(ResilienceError::PoolExhausted),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[derive(Debug, Clone, PartialEq)]
    struct TestClient(usize);

    #[tokio::test]
    async fn acquire_reuses_cached_client() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig::default());
        let built = Arc::new(AtomicUsize::new(0));
        let now = t0();

        for _ in 0..3 {
            let built = built.clone();
            let client = pool
                .acquire_or_create("fp-1", now, || async move {
                    Ok(TestClient(built.fetch_add(1, Ordering::SeqCst)))
                })
                .await
                .unwrap();
            assert_eq!(client, TestClient(0));
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        let stats = pool.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(pool.usage_count("fp-1").await, Some(3));
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig {
            max_size: 2,
            idle_eviction: Duration::from_secs(1800),
        });
        let now = t0();

        pool.acquire_or_create("a", now, || async { Ok(TestClient(1)) })
            .await
            .unwrap();
        pool.acquire_or_create("b", now + chrono::Duration::seconds(10), || async {
            Ok(TestClient(2))
        })
        .await
        .unwrap();

        // Touch "a" so "b" becomes LRU
        pool.acquire_or_create("a", now + chrono::Duration::seconds(20), || async {
            Ok(TestClient(99))
        })
        .await
        .unwrap();

        pool.acquire_or_create("c", now + chrono::Duration::seconds(30), || async {
            Ok(TestClient(3))
        })
        .await
        .unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(pool.usage_count("b").await, None);
        assert!(pool.usage_count("a").await.is_some());
    }

    #[tokio::test]
    async fn optimize_evicts_stale_entries() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig {
            max_size: 10,
            idle_eviction: Duration::from_secs(1800),
        });
        let now = t0();

        pool.acquire_or_create("old", now, || async { Ok(TestClient(1)) })
            .await
            .unwrap();
        let later = now + chrono::Duration::seconds(1700);
        pool.acquire_or_create("fresh", later, || async { Ok(TestClient(2)) })
            .await
            .unwrap();

        let evicted = pool.optimize(now + chrono::Duration::seconds(1900)).await;
        assert_eq!(evicted, 1);
        assert_eq!(pool.usage_count("old").await, None);
        assert!(pool.usage_count("fresh").await.is_some());
    }

    #[tokio::test]
    async fn warm_up_respects_capacity() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig {
            max_size: 2,
            idle_eviction: Duration::from_secs(1800),
        });
        let now = t0();

        let inserted = pool
            .warm_up(
                vec![
                    ("a".to_string(), TestClient(1)),
                    ("b".to_string(), TestClient(2)),
                    ("a".to_string(), TestClient(3)), // duplicate, kept out
                ],
                now,
            )
            .await;
        assert_eq!(inserted, 2);
        assert_eq!(pool.stats().await.size, 2);
    }

    #[tokio::test]
    async fn invalidate_drops_entry() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig::default());
        let now = t0();

        pool.acquire_or_create("fp", now, || async { Ok(TestClient(1)) })
            .await
            .unwrap();
        assert!(pool.invalidate("fp").await);
        assert!(!pool.invalidate("fp").await);

        // Next acquire rebuilds
        let client = pool
            .acquire_or_create("fp", now, || async { Ok(TestClient(2)) })
            .await
            .unwrap();
        assert_eq!(client, TestClient(2));
    }

    #[tokio::test]
    async fn creation_failure_is_propagated() {
        let pool: ClientPool<TestClient> = ClientPool::new(PoolConfig::default());
        let result = pool
            .acquire_or_create("fp", t0(), || async {
                Err(ResilienceError::ClientCreation("bad credential".to_string()))
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::ClientCreation(_))));
        assert_eq!(pool.stats().await.size, 0);
    }
}
