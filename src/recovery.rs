//! RecoveryStrategyEngine: what to do after a classified failure
//!
//! Consumes an [`ErrorKind`] and decides between retrying now, scheduling a
//! deferred retry, or giving up and flagging the connection for manual
//! reconnection. Deferred retries are handed to a [`TaskQueue`] rather than
//! slept on, so the engine stays synchronous and push-based regardless of
//! what actually executes the tasks.
//!
//! A max-attempt ceiling converts "retryable" into "requires reconnection"
//! once exhausted; nothing is ever retried silently forever.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::refresh::{Operation, TokenRefreshCoordinator};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tether_core_classify::ErrorKind;
use tether_core_health::{HealthStatusStore, Provider};
use tracing::{debug, info, instrument, warn};

/// Result of a recovery attempt. Exceptions travel as `Err` on the method.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// The connection is working again
    Resolved,
    /// Still broken; `retry_after` carries the earliest sensible retry time,
    /// or None when automatic retry is pointless
    StillFailing { retry_after: Option<Duration> },
}

/// Where the failure being recovered from happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureContext {
    /// The token refresh itself failed; one attempt is already spent
    RefreshFailure,
    /// Some other provider operation failed (an upload, a listing)
    OperationFailure,
}

/// A deferred retry handed off to the embedding application's queue
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub user_id: String,
    pub provider: Provider,
    pub operation: Operation,
    /// Earliest instant the task should run
    pub not_before: DateTime<Utc>,
    /// Failure count at scheduling time
    pub attempt: u32,
}

/// Generic fire-and-forget task queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: RetryTask) -> anyhow::Result<()>;
}

/// Default queue: records the schedule in the log and drops the task.
/// Deployments wire a real queue here.
#[derive(Debug, Default)]
pub struct LogQueue;

#[async_trait]
impl TaskQueue for LogQueue {
    async fn enqueue(&self, task: RetryTask) -> anyhow::Result<()> {
        debug!(
            user_id = %task.user_id,
            provider = %task.provider,
            operation = %task.operation,
            not_before = %task.not_before,
            attempt = task.attempt,
            "retry task scheduled (log-only queue)"
        );
        Ok(())
    }
}

/// Exponential backoff with a cap and ±10% jitter.
///
/// `attempt` is the number of failures so far; the first retry waits
/// roughly the base delay.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw_ms = base
        .as_millis()
        .saturating_mul(1u128 << exponent)
        .min(cap.as_millis());
    let jitter = rand::rng().random_range(0.9..=1.1);
    let jittered = ((raw_ms as f64) * jitter) as u64;
    Duration::from_millis(jittered).min(cap)
}

/// Drives the per-kind recovery strategy table
pub struct RecoveryEngine {
    coordinator: Arc<TokenRefreshCoordinator>,
    store: Arc<HealthStatusStore>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl RecoveryEngine {
    pub fn new(
        coordinator: Arc<TokenRefreshCoordinator>,
        store: Arc<HealthStatusStore>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            queue,
            clock,
            config,
        }
    }

    /// Attempt automated recovery for a classified failure.
    ///
    /// Strategy table:
    /// - token/auth kinds: one forced refresh (unless the failure WAS the
    ///   refresh); a second failure leaves the sticky reconnection flag
    /// - network / service kinds: exponential-backoff deferred retry
    /// - API quota: wait out the provider's window, surfaced as retry_after
    /// - permission / credential kinds: reconnection only, retry is pointless
    /// - unknown: one short-delay retry, then surface for inspection
    #[instrument(skip(self), fields(%user_id, %provider, %kind, ?context))]
    pub async fn attempt_recovery(
        &self,
        user_id: &str,
        provider: Provider,
        kind: ErrorKind,
        context: FailureContext,
    ) -> Result<RecoveryOutcome, EngineError> {
        let now = self.clock.now();
        let health = self.store.get_or_create(user_id, provider, now).await?;

        // Ceiling: a retryable failure that has been retried into the ground
        // stops being retryable
        if kind.is_retryable()
            && !kind.requires_reconnection()
            && health.consecutive_failures >= self.config.health.max_auto_retries
        {
            warn!(
                failures = health.consecutive_failures,
                "automatic retries exhausted, escalating to reconnection"
            );
            self.store
                .escalate_to_reconnection(user_id, provider, "automatic retries exhausted", now)
                .await?;
            return Ok(RecoveryOutcome::StillFailing { retry_after: None });
        }

        match kind {
            ErrorKind::TokenExpired if context == FailureContext::OperationFailure => {
                // An expired access token during an operation: one refresh
                // attempt resolves it or proves it unresolvable
                match self.coordinator.ensure_valid_forced(user_id, provider).await {
                    Ok(_) => {
                        info!("recovered via forced token refresh");
                        Ok(RecoveryOutcome::Resolved)
                    }
                    Err(EngineError::RateLimited { retry_after, .. }) => {
                        Ok(RecoveryOutcome::StillFailing {
                            retry_after: Some(retry_after),
                        })
                    }
                    Err(_) => Ok(RecoveryOutcome::StillFailing { retry_after: None }),
                }
            }

            ErrorKind::TokenExpired
            | ErrorKind::InvalidRefreshToken
            | ErrorKind::InsufficientPermissions
            | ErrorKind::InvalidCredentials => {
                // The refresh path already failed (or cannot help); the
                // record_failure transition set the sticky flag
                Ok(RecoveryOutcome::StillFailing { retry_after: None })
            }

            ErrorKind::NetworkError | ErrorKind::ServiceUnavailable => {
                let delay = backoff_delay(
                    Duration::from_secs(self.config.health.backoff_base_secs),
                    Duration::from_secs(self.config.health.backoff_cap_secs),
                    health.consecutive_failures.max(1),
                );
                self.schedule_retry(user_id, provider, delay, health.consecutive_failures, now)
                    .await;
                Ok(RecoveryOutcome::StillFailing {
                    retry_after: Some(delay),
                })
            }

            ErrorKind::ApiQuotaExceeded => {
                // Retrying inside the quota window only digs the hole deeper
                let delay = kind.metadata().default_backoff;
                self.schedule_retry(user_id, provider, delay, health.consecutive_failures, now)
                    .await;
                Ok(RecoveryOutcome::StillFailing {
                    retry_after: Some(delay),
                })
            }

            ErrorKind::StorageQuotaExceeded => {
                // Only the user freeing space fixes this; surface an estimate
                Ok(RecoveryOutcome::StillFailing {
                    retry_after: Some(kind.metadata().default_backoff),
                })
            }

            ErrorKind::UnknownError => {
                if health.consecutive_failures <= 1 {
                    let delay = kind.metadata().default_backoff;
                    self.schedule_retry(user_id, provider, delay, health.consecutive_failures, now)
                        .await;
                    Ok(RecoveryOutcome::StillFailing {
                        retry_after: Some(delay),
                    })
                } else {
                    // Twice unknown: stop guessing, surface for inspection
                    Ok(RecoveryOutcome::StillFailing { retry_after: None })
                }
            }

            // File-level failures say nothing about the connection; nothing
            // to recover here
            ErrorKind::FileNotFound
            | ErrorKind::FolderAccessDenied
            | ErrorKind::InvalidFileType
            | ErrorKind::FileTooLarge
            | ErrorKind::InvalidFileContent => {
                Ok(RecoveryOutcome::StillFailing { retry_after: None })
            }
        }
    }

    async fn schedule_retry(
        &self,
        user_id: &str,
        provider: Provider,
        delay: Duration,
        attempt: u32,
        now: DateTime<Utc>,
    ) {
        let task = RetryTask {
            user_id: user_id.to_string(),
            provider,
            operation: Operation::TokenRefresh,
            not_before: now + chrono::Duration::seconds(delay.as_secs() as i64),
            attempt,
        };
        if let Err(e) = self.queue.enqueue(task).await {
            // The queue is fire-and-forget; a drop costs one retry cycle
            warn!(error = %e, "failed to enqueue retry task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(900);

        let first = backoff_delay(base, cap, 1);
        assert!(first >= Duration::from_millis(4500) && first <= Duration::from_millis(5500));

        let third = backoff_delay(base, cap, 3);
        assert!(third >= Duration::from_millis(18_000) && third <= Duration::from_millis(22_000));

        let huge = backoff_delay(base, cap, 30);
        assert!(huge <= cap);
        assert!(huge >= Duration::from_millis(810_000));
    }

    #[test]
    fn backoff_attempt_zero_behaves_like_first() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(900);
        let delay = backoff_delay(base, cap, 0);
        assert!(delay <= Duration::from_millis(5500));
    }
}
