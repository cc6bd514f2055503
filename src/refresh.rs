//! TokenRefreshCoordinator: the refresh decision pipeline
//!
//! # The seven steps
//!
//! `ensure_valid` runs every request through the same gauntlet:
//!
//! ```text
//! 1. Cache        ── recent validity result?        ──► return, 0 calls
//! 2. Credential   ── none on file?                  ──► NotConnected
//! 3. Lookahead    ── not expiring soon, not forced? ──► no-op, current token
//! 4. Rate limiter ── window exhausted?              ──► RateLimited{retry_after}
//! 5. Race check   ── someone already refreshed?     ──► AlreadyRefreshed
//! 6. Provider     ── pooled client, with timeout    ──► persist + record_success
//! 7. Failure      ── classify + record_failure      ──► Provider{kind}
//! ```
//!
//! Steps 5–7 run under a per-pair guard, so two simultaneous callers for the
//! same connection produce at most one provider call; the loser observes the
//! moved expiry and short-circuits with `AlreadyRefreshed`, which is the
//! expected outcome of optimistic concurrency and is never logged as a
//! failure. Pairs never contend with each other.
//!
//! Batch mode chunks candidates and fans out with bounded parallelism. Dry
//! run is pure by construction: it uses only read-only paths (`peek` on the
//! limiter, no cache writes, no store writes, no provider calls).

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::provider::{ProviderClient, ProviderClientFactory, ProviderError};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_core_classify::{classify, ErrorKind};
use tether_core_health::store::SuccessMeta;
use tether_core_health::{Credential, CredentialStore, HealthStatusStore, Provider};
use tether_core_resilience::{ClientPool, Decision, TtlCache, WindowLimiter, WindowSnapshot};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Provider-facing operations gated by the rate limiter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    TokenRefresh,
    ConnectivityTest,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::TokenRefresh => write!(f, "token_refresh"),
            Operation::ConnectivityTest => write!(f, "connectivity_test"),
        }
    }
}

/// Identifies one connection across limiters and guards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub user_id: String,
    pub provider: Provider,
}

/// Check types with independently cached results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckType {
    TokenValidity,
    Connectivity,
}

/// Cache key scoped per (user, provider, check type)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckKey {
    pub user_id: String,
    pub provider: Provider,
    pub check: CheckType,
}

/// Cached result of an expensive check
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    TokenValid(Token),
    ConnectivityOk,
    Failed(ErrorKind),
}

/// The access token handed back to callers. Refresh tokens never leave the
/// credential store through this type.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    fn from_credential(credential: &Credential) -> Self {
        Self {
            access_token: credential.access_token.clone(),
            expires_at: credential.expires_at,
        }
    }
}

/// Successful results of `ensure_valid`. Only the `Refreshed` variant cost a
/// provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The current token is fine as-is
    Valid {
        token: Token,
        /// Whether this was answered from the check cache
        from_cache: bool,
    },
    /// The provider issued a fresh token on this call
    Refreshed(Token),
    /// A concurrent caller refreshed first; this is not an error
    AlreadyRefreshed(Token),
}

impl RefreshOutcome {
    /// The usable token, whichever path produced it
    pub fn token(&self) -> &Token {
        match self {
            RefreshOutcome::Valid { token, .. } => token,
            RefreshOutcome::Refreshed(token) => token,
            RefreshOutcome::AlreadyRefreshed(token) => token,
        }
    }
}

/// Rate limiter snapshots for one connection
#[derive(Debug, Clone, Copy)]
pub struct RateLimitReport {
    pub token_refresh: WindowSnapshot,
    pub connectivity_test: WindowSnapshot,
}

/// What a dry-run batch pass would do for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    WouldRefresh,
    NotNeeded,
    WouldRateLimit { retry_after: Duration },
}

/// Planned action for one user in a dry run
#[derive(Debug, Clone)]
pub struct PlannedRefresh {
    pub user_id: String,
    pub action: PlannedAction,
}

/// One failed candidate in a batch run
#[derive(Debug, Clone)]
pub struct BatchError {
    pub user_id: String,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

/// Outcome of a batch refresh pass
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub dry_run: bool,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<BatchError>,
    /// Populated only in dry runs
    pub planned: Vec<PlannedRefresh>,
}

impl BatchReport {
    /// Compact JSON summary for operational logs and scheduled-job reports
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "dry_run": self.dry_run,
            "processed": self.processed,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "skipped": self.skipped,
            "errors": self
                .errors
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "user_id": e.user_id,
                        "kind": e.kind.map(|k| k.to_string()),
                        "message": e.message,
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

/// Orchestrates single and batch token refresh over the protection
/// primitives and the health store.
pub struct TokenRefreshCoordinator {
    store: Arc<HealthStatusStore>,
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn ProviderClientFactory>,
    pool: ClientPool<Arc<dyn ProviderClient>>,
    refresh_limiter: WindowLimiter<ConnectionKey>,
    probe_limiter: WindowLimiter<ConnectionKey>,
    cache: TtlCache<CheckKey, CheckOutcome>,
    inflight: Mutex<HashMap<ConnectionKey, Arc<Mutex<()>>>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl TokenRefreshCoordinator {
    pub fn new(
        store: Arc<HealthStatusStore>,
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn ProviderClientFactory>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool: ClientPool::new(config.pool_config()),
            refresh_limiter: WindowLimiter::new(config.refresh_limit()),
            probe_limiter: WindowLimiter::new(config.probe_limit()),
            cache: TtlCache::new(config.cache_config()),
            inflight: Mutex::new(HashMap::new()),
            store,
            credentials,
            factory,
            clock,
            config,
        }
    }

    /// Ensure the pair has a usable access token, refreshing only when the
    /// expiry falls within the proactive lookahead window.
    pub async fn ensure_valid(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<RefreshOutcome, EngineError> {
        self.ensure_valid_with(user_id, provider, false).await
    }

    /// `ensure_valid` with the lookahead no-op and cache hit disabled, for
    /// recovery paths that must hit the provider.
    pub async fn ensure_valid_forced(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<RefreshOutcome, EngineError> {
        self.ensure_valid_with(user_id, provider, true).await
    }

    #[instrument(skip(self), fields(%user_id, %provider, force))]
    pub async fn ensure_valid_with(
        &self,
        user_id: &str,
        provider: Provider,
        force: bool,
    ) -> Result<RefreshOutcome, EngineError> {
        let now = self.clock.now();
        let validity_key = self.check_key(user_id, provider, CheckType::TokenValidity);

        // Step 1: a recent validity result answers without any provider work
        if !force {
            if let Some(CheckOutcome::TokenValid(token)) = self.cache.get(&validity_key, now) {
                if !self.near_expiry(token.expires_at, now) {
                    debug!("token validity served from cache");
                    return Ok(RefreshOutcome::Valid {
                        token,
                        from_cache: true,
                    });
                }
            }
        }

        // Step 2: no credential means nothing to refresh; the limiter is
        // deliberately not consulted or charged
        let Some(observed) = self.credentials.load(user_id, provider).await? else {
            self.store.get_or_create(user_id, provider, now).await?;
            return Err(EngineError::NotConnected {
                user_id: user_id.to_string(),
                provider,
            });
        };

        // Step 3: a token nowhere near expiry is left alone
        if !force && !observed.expires_within(now, self.config.lookahead()) {
            let token = Token::from_credential(&observed);
            self.cache
                .insert_success(&validity_key, CheckOutcome::TokenValid(token.clone()), now);
            return Ok(RefreshOutcome::Valid {
                token,
                from_cache: false,
            });
        }

        // Step 4: back-pressure
        let key = ConnectionKey {
            user_id: user_id.to_string(),
            provider,
        };
        if let Decision::Denied { retry_after } = self.refresh_limiter.try_acquire(&key, now) {
            debug!(?retry_after, "token refresh rate limited");
            return Err(EngineError::RateLimited {
                operation: Operation::TokenRefresh,
                retry_after,
            });
        }

        // Steps 5-7 run under the per-pair guard so concurrent callers for
        // one connection produce at most one provider call
        let guard = self.pair_guard(&key).await;
        let _locked = guard.lock().await;
        let now = self.clock.now();

        // Step 5: re-read immediately before the provider call; a moved
        // expiry means a concurrent refresh already won
        let Some(current) = self.credentials.load(user_id, provider).await? else {
            return Err(EngineError::NotConnected {
                user_id: user_id.to_string(),
                provider,
            });
        };
        if current.expires_at > observed.expires_at {
            debug!("credential already refreshed by a concurrent caller");
            return Ok(RefreshOutcome::AlreadyRefreshed(Token::from_credential(
                &current,
            )));
        }

        // Step 6: the only provider round trip in the pipeline
        match self.refresh_via_provider(&current, now).await {
            Ok(refreshed) => {
                let mut updated = current.clone();
                updated.access_token = refreshed.access_token;
                updated.expires_at = refreshed.expires_at;
                if let Some(rotated) = refreshed.refresh_token {
                    updated.refresh_token = rotated;
                }
                self.credentials.persist(&updated).await?;

                // The pooled client was built from the superseded credential
                self.pool.invalidate(&current.fingerprint()).await;
                self.invalidate_checks(user_id, provider);

                self.store
                    .record_success(
                        user_id,
                        provider,
                        SuccessMeta {
                            token_expires_at: Some(updated.expires_at),
                            operation: Some("token_refresh".to_string()),
                        },
                        now,
                    )
                    .await?;

                info!(expires_at = %updated.expires_at, "token refreshed");
                Ok(RefreshOutcome::Refreshed(Token::from_credential(&updated)))
            }
            // Step 7: classify, record, surface
            Err(provider_error) => {
                let kind = classify(&provider_error.message, provider_error.http_status);
                self.invalidate_checks(user_id, provider);
                self.store
                    .record_failure(user_id, provider, kind, &provider_error.message, now)
                    .await?;

                warn!(%kind, "token refresh failed");
                Err(EngineError::Provider {
                    kind,
                    message: provider_error.message,
                })
            }
        }
    }

    /// Cheap provider connectivity probe, cached and rate limited.
    ///
    /// Returns whether the answer came from cache. A cached failure is
    /// returned as the classified error without touching the provider.
    #[instrument(skip(self), fields(%user_id, %provider))]
    pub async fn check_connectivity(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let key = self.check_key(user_id, provider, CheckType::Connectivity);

        match self.cache.get(&key, now) {
            Some(CheckOutcome::ConnectivityOk) => return Ok(true),
            Some(CheckOutcome::Failed(kind)) => {
                return Err(EngineError::Provider {
                    kind,
                    message: "cached connectivity failure".to_string(),
                })
            }
            _ => {}
        }

        let Some(credential) = self.credentials.load(user_id, provider).await? else {
            self.store.get_or_create(user_id, provider, now).await?;
            return Err(EngineError::NotConnected {
                user_id: user_id.to_string(),
                provider,
            });
        };

        let limit_key = ConnectionKey {
            user_id: user_id.to_string(),
            provider,
        };
        if let Decision::Denied { retry_after } = self.probe_limiter.try_acquire(&limit_key, now) {
            return Err(EngineError::RateLimited {
                operation: Operation::ConnectivityTest,
                retry_after,
            });
        }

        match self.probe_via_provider(&credential, now).await {
            Ok(()) => {
                self.cache
                    .insert_success(&key, CheckOutcome::ConnectivityOk, now);
                self.store
                    .record_success(
                        user_id,
                        provider,
                        SuccessMeta {
                            token_expires_at: None,
                            operation: Some("connectivity_test".to_string()),
                        },
                        now,
                    )
                    .await?;
                Ok(false)
            }
            Err(provider_error) => {
                let kind = classify(&provider_error.message, provider_error.http_status);
                self.cache.insert_failure(&key, CheckOutcome::Failed(kind), now);
                self.store
                    .record_failure(user_id, provider, kind, &provider_error.message, now)
                    .await?;
                Err(EngineError::Provider {
                    kind,
                    message: provider_error.message,
                })
            }
        }
    }

    /// Batch refresh over all credentials of a provider expiring within
    /// `window_hours` (or already expired).
    ///
    /// Chunks of `batch_size` are processed with parallelism bounded by the
    /// pool size, never unbounded fan-out. With `dry_run` the pass only
    /// reports what it would do: zero provider calls, zero state mutation.
    #[instrument(skip(self), fields(%provider, window_hours, batch_size, dry_run))]
    pub async fn process_batch(
        &self,
        provider: Provider,
        window_hours: u64,
        batch_size: usize,
        dry_run: bool,
    ) -> Result<BatchReport, EngineError> {
        let now = self.clock.now();
        let window = Duration::from_secs(window_hours * 3600);
        let batch_size = batch_size.max(1);

        let candidates: Vec<Credential> = self
            .credentials
            .list(provider)
            .await?
            .into_iter()
            .filter(|c| c.is_expired(now) || c.expires_within(now, window))
            .collect();

        let mut report = BatchReport {
            dry_run,
            ..Default::default()
        };
        let parallelism = batch_size.min(self.config.pool.max_size).max(1);

        for chunk in candidates.chunks(batch_size) {
            if dry_run {
                for credential in chunk {
                    report.processed += 1;
                    let action = self.plan_refresh(credential, now);
                    report.planned.push(PlannedRefresh {
                        user_id: credential.user_id.clone(),
                        action,
                    });
                }
                continue;
            }

            let results: Vec<(String, Result<RefreshOutcome, EngineError>)> =
                stream::iter(chunk.iter().map(|credential| {
                    let user_id = credential.user_id.clone();
                    async move {
                        let result = self.ensure_valid_with(&user_id, provider, false).await;
                        (user_id, result)
                    }
                }))
                .buffer_unordered(parallelism)
                .collect()
                .await;

            for (user_id, result) in results {
                report.processed += 1;
                match result {
                    Ok(RefreshOutcome::Valid { .. }) => report.skipped += 1,
                    Ok(RefreshOutcome::Refreshed(_))
                    | Ok(RefreshOutcome::AlreadyRefreshed(_)) => report.succeeded += 1,
                    Err(EngineError::RateLimited { .. }) => report.skipped += 1,
                    Err(err) => {
                        report.failed += 1;
                        report.errors.push(BatchError {
                            user_id,
                            kind: err.kind(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "batch refresh pass complete"
        );
        Ok(report)
    }

    /// Pre-build clients for the given users before a batch run
    pub async fn warm_up(&self, user_ids: &[String], provider: Provider) -> usize {
        let now = self.clock.now();
        let mut clients = Vec::new();

        for user_id in user_ids {
            let credential = match self.credentials.load(user_id, provider).await {
                Ok(Some(credential)) => credential,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%user_id, error = %e, "skipping warm-up candidate");
                    continue;
                }
            };
            match self.factory.build(&credential).await {
                Ok(client) => clients.push((credential.fingerprint(), client)),
                Err(e) => warn!(%user_id, error = %e, "client warm-up build failed"),
            }
        }

        self.pool.warm_up(clients, now).await
    }

    /// Rate limiter snapshots for one connection
    pub fn rate_limit_report(&self, user_id: &str, provider: Provider) -> RateLimitReport {
        let now = self.clock.now();
        let key = ConnectionKey {
            user_id: user_id.to_string(),
            provider,
        };
        RateLimitReport {
            token_refresh: self.refresh_limiter.status(&key, now),
            connectivity_test: self.probe_limiter.status(&key, now),
        }
    }

    /// Evict stale pool entries; maintenance entry point
    pub async fn optimize_pool(&self) -> usize {
        self.pool.optimize(self.clock.now()).await
    }

    /// Pool statistics, for reporting
    pub async fn pool_stats(&self) -> tether_core_resilience::PoolStats {
        self.pool.stats().await
    }

    /// Drop both cached check results for a pair. Called on every refresh
    /// outcome and on credential replacement.
    pub fn invalidate_checks(&self, user_id: &str, provider: Provider) {
        self.cache
            .invalidate(&self.check_key(user_id, provider, CheckType::TokenValidity));
        self.cache
            .invalidate(&self.check_key(user_id, provider, CheckType::Connectivity));
    }

    /// Read-only projection of what `ensure_valid` would do. Used by dry
    /// runs; must not mutate limiter, cache, store, or credential state.
    fn plan_refresh(&self, credential: &Credential, now: DateTime<Utc>) -> PlannedAction {
        if !credential.is_expired(now) && !credential.expires_within(now, self.config.lookahead()) {
            return PlannedAction::NotNeeded;
        }
        let key = ConnectionKey {
            user_id: credential.user_id.clone(),
            provider: credential.provider,
        };
        match self.refresh_limiter.peek(&key, now) {
            Decision::Denied { retry_after } => PlannedAction::WouldRateLimit { retry_after },
            Decision::Allowed => PlannedAction::WouldRefresh,
        }
    }

    async fn refresh_via_provider(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<crate::provider::RefreshedToken, ProviderError> {
        let client = self.pooled_client(credential, now).await?;
        let timeout = self.config.provider_timeout();
        match tokio::time::timeout(timeout, client.refresh_token(&credential.refresh_token)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(format!(
                "token refresh timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn probe_via_provider(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        let client = self.pooled_client(credential, now).await?;
        let timeout = self.config.provider_timeout();
        match tokio::time::timeout(timeout, client.probe()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(format!(
                "connectivity probe timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn pooled_client(
        &self,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        let fingerprint = credential.fingerprint();
        self.pool
            .acquire_or_create(&fingerprint, now, || async {
                self.factory.build(credential).await.map_err(|e| {
                    tether_core_resilience::ResilienceError::ClientCreation(e.message)
                })
            })
            .await
            .map_err(|e| match e {
                tether_core_resilience::ResilienceError::ClientCreation(message) => {
                    ProviderError::new(message)
                }
                other => ProviderError::new(other.to_string()),
            })
    }

    /// Guard serializing steps 5-7 per connection. Guards are a few bytes
    /// each and reused for the process lifetime.
    async fn pair_guard(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn check_key(&self, user_id: &str, provider: Provider, check: CheckType) -> CheckKey {
        CheckKey {
            user_id: user_id.to_string(),
            provider,
            check,
        }
    }

    fn near_expiry(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at <= now + chrono::Duration::seconds(self.config.lookahead().as_secs() as i64)
    }
}
