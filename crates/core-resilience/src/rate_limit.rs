//! Keyed rolling-window rate limiting
//!
//! Tracks attempt counts per key inside a fixed-duration rolling window that
//! is reset lazily on first access after expiry. A denied attempt is
//! back-pressure, not a failure: the decision carries a `retry_after` hint so
//! callers can schedule instead of poll.
//!
//! The limiter is pure logic: the caller supplies `now` on every call, which
//! keeps tests deterministic and leaves clock ownership to the embedding
//! application.
//!
//! # Example
//!
//! ```
//! use tether_core_resilience::rate_limit::{Decision, RateLimitConfig, WindowLimiter};
//! use std::time::Duration;
//! use chrono::Utc;
//!
//! let limiter = WindowLimiter::new(RateLimitConfig {
//!     max_attempts: 2,
//!     window: Duration::from_secs(3600),
//! });
//!
//! let now = Utc::now();
//! assert!(matches!(limiter.try_acquire(&"user-1", now), Decision::Allowed));
//! assert!(matches!(limiter.try_acquire(&"user-1", now), Decision::Allowed));
//! assert!(matches!(limiter.try_acquire(&"user-1", now), Decision::Denied { .. }));
//! // Other keys are unaffected
//! assert!(matches!(limiter.try_acquire(&"user-2", now), Decision::Allowed));
//! ```

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Configuration for a rolling-window limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum attempts allowed within one window
    pub max_attempts: u32,
    /// Window duration (reset lazily on first access after expiry)
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::from_secs(3600),
        }
    }
}

/// Outcome of an acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The attempt was admitted and counted
    Allowed,
    /// The window is exhausted; retry once it has rolled over
    Denied {
        /// Time remaining until the window resets
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the attempt was admitted
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Snapshot of one key's window, for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Attempts consumed in the current window
    pub attempts: u32,
    /// Configured cap
    pub max_attempts: u32,
    /// Whether another attempt would be admitted right now
    pub can_attempt: bool,
    /// Time until the current window rolls over
    pub resets_in: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    window_start: DateTime<Utc>,
    attempts: u32,
}

/// Per-key rolling-window attempt limiter.
///
/// Counters use lock-protected read-modify-write so concurrent callers for
/// the same key never lose updates. The lock is never held across await
/// points; all operations are cheap and in-memory.
#[derive(Debug)]
pub struct WindowLimiter<K: Eq + Hash + Clone> {
    config: RateLimitConfig,
    windows: Mutex<HashMap<K, Window>>,
}

impl<K: Eq + Hash + Clone> WindowLimiter<K> {
    /// Create a limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to consume one slot for `key`.
    ///
    /// Expired windows are reset lazily here; there is no background sweeper.
    pub fn try_acquire(&self, key: &K, now: DateTime<Utc>) -> Decision {
        let window = chrono_window(self.config.window);
        let mut windows = self.windows.lock().expect("limiter lock poisoned");

        let entry = windows.entry(key.clone()).or_insert(Window {
            window_start: now,
            attempts: 0,
        });

        if now - entry.window_start >= window {
            entry.window_start = now;
            entry.attempts = 0;
        }

        if entry.attempts >= self.config.max_attempts {
            let resets_at = entry.window_start + window;
            return Decision::Denied {
                retry_after: until(resets_at, now),
            };
        }

        entry.attempts += 1;
        Decision::Allowed
    }

    /// Report what `try_acquire` would return, without consuming a slot.
    ///
    /// Dry-run paths rely on this being free of side effects.
    pub fn peek(&self, key: &K, now: DateTime<Utc>) -> Decision {
        let window = chrono_window(self.config.window);
        let windows = self.windows.lock().expect("limiter lock poisoned");

        match windows.get(key) {
            None => Decision::Allowed,
            Some(entry) => {
                if now - entry.window_start >= window {
                    return Decision::Allowed;
                }
                if entry.attempts >= self.config.max_attempts {
                    Decision::Denied {
                        retry_after: until(entry.window_start + window, now),
                    }
                } else {
                    Decision::Allowed
                }
            }
        }
    }

    /// Snapshot of the current window for `key`
    pub fn status(&self, key: &K, now: DateTime<Utc>) -> WindowSnapshot {
        let window = chrono_window(self.config.window);
        let windows = self.windows.lock().expect("limiter lock poisoned");

        let (attempts, resets_in) = match windows.get(key) {
            None => (0, self.config.window),
            Some(entry) if now - entry.window_start >= window => (0, self.config.window),
            Some(entry) => (entry.attempts, until(entry.window_start + window, now)),
        };

        WindowSnapshot {
            attempts,
            max_attempts: self.config.max_attempts,
            can_attempt: attempts < self.config.max_attempts,
            resets_in,
        }
    }

    /// Drop windows that have fully expired. Returns the number removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let window = chrono_window(self.config.window);
        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        let before = windows.len();
        windows.retain(|_, w| now - w.window_start < window);
        before - windows.len()
    }

    /// Number of live (possibly expired, not yet pruned) windows
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().expect("limiter lock poisoned").len()
    }
}

fn chrono_window(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs() as i64)
}

fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Governor-backed keyed limiter (when the feature is enabled).
///
/// Offers burst-capable quotas via the governor crate for deployments that
/// want pacing rather than hourly counters. The rolling-window semantics of
/// [`WindowLimiter`] remain the default.
#[cfg(feature = "governor-impl")]
pub mod governor_impl {
    use super::*;
    use governor::{Quota, RateLimiter};
    use std::num::NonZeroU32;

    /// Keyed limiter wrapper using governor's in-memory keyed state
    pub struct GovernorLimiter<K: Eq + Hash + Clone> {
        limiter: governor::DefaultKeyedRateLimiter<K>,
        window: Duration,
    }

    impl<K: Eq + Hash + Clone> GovernorLimiter<K> {
        /// Create a governor-backed limiter from the same configuration
        pub fn new(config: &RateLimitConfig) -> Result<Self, crate::error::ResilienceError> {
            let max = NonZeroU32::new(config.max_attempts).ok_or_else(|| {
                crate::error::ResilienceError::ClientCreation(
                    "max_attempts must be > 0".to_string(),
                )
            })?;
            let quota = Quota::with_period(config.window)
                .ok_or_else(|| {
                    crate::error::ResilienceError::ClientCreation("invalid window".to_string())
                })?
                .allow_burst(max);

            Ok(Self {
                limiter: RateLimiter::keyed(quota),
                window: config.window,
            })
        }

        /// Attempt to consume one slot for `key`
        pub fn try_acquire(&self, key: &K) -> Decision {
            match self.limiter.check_key(key) {
                Ok(_) => Decision::Allowed,
                Err(_) => Decision::Denied {
                    retry_after: self.window,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn limiter(max: u32) -> WindowLimiter<&'static str> {
        WindowLimiter::new(RateLimitConfig {
            max_attempts: max,
            window: Duration::from_secs(3600),
        })
    }

    #[test]
    fn cap_is_enforced_at_n_plus_one() {
        let limiter = limiter(3);
        let now = t0();

        for _ in 0..3 {
            assert_eq!(limiter.try_acquire(&"k", now), Decision::Allowed);
        }
        match limiter.try_acquire(&"k", now) {
            Decision::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(3600));
            }
            Decision::Allowed => panic!("fourth attempt should be denied"),
        }
    }

    #[test]
    fn window_rolls_over() {
        let limiter = limiter(1);
        let now = t0();

        assert!(limiter.try_acquire(&"k", now).is_allowed());
        assert!(!limiter.try_acquire(&"k", now).is_allowed());

        let later = now + chrono::Duration::seconds(3601);
        assert!(limiter.try_acquire(&"k", later).is_allowed());
    }

    #[test]
    fn peek_does_not_consume() {
        let limiter = limiter(1);
        let now = t0();

        for _ in 0..5 {
            assert!(limiter.peek(&"k", now).is_allowed());
        }
        assert!(limiter.try_acquire(&"k", now).is_allowed());
        assert!(!limiter.peek(&"k", now).is_allowed());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1);
        let now = t0();

        assert!(limiter.try_acquire(&"a", now).is_allowed());
        assert!(limiter.try_acquire(&"b", now).is_allowed());
        assert!(!limiter.try_acquire(&"a", now).is_allowed());
    }

    #[test]
    fn status_snapshot() {
        let limiter = limiter(2);
        let now = t0();

        let fresh = limiter.status(&"k", now);
        assert_eq!(fresh.attempts, 0);
        assert!(fresh.can_attempt);

        limiter.try_acquire(&"k", now);
        limiter.try_acquire(&"k", now);
        let full = limiter.status(&"k", now + chrono::Duration::seconds(600));
        assert_eq!(full.attempts, 2);
        assert!(!full.can_attempt);
        assert_eq!(full.resets_in, Duration::from_secs(3000));
    }

    #[test]
    fn prune_drops_expired_windows() {
        let limiter = limiter(5);
        let now = t0();

        limiter.try_acquire(&"a", now);
        limiter.try_acquire(&"b", now);
        assert_eq!(limiter.tracked_keys(), 2);

        assert_eq!(limiter.prune(now + chrono::Duration::seconds(60)), 0);
        assert_eq!(limiter.prune(now + chrono::Duration::seconds(3601)), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn retry_after_shrinks_as_window_ages() {
        let limiter = limiter(1);
        let now = t0();

        limiter.try_acquire(&"k", now);
        let mid = now + chrono::Duration::seconds(1800);
        match limiter.try_acquire(&"k", mid) {
            Decision::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(1800));
            }
            Decision::Allowed => panic!("should be denied mid-window"),
        }
    }
}
