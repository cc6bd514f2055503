//! Engine facade: the surface the surrounding application talks to
//!
//! Owns the wiring of store, coordinator, and recovery engine around the
//! injected collaborators (credential store, provider client factory,
//! notification sink, task queue, clock). Everything behind this facade is
//! reachable individually for embedders that need finer control, but the
//! methods here are the supported contract.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::provider::ProviderClientFactory;
use crate::recovery::{FailureContext, LogQueue, RecoveryEngine, RecoveryOutcome, TaskQueue};
use crate::refresh::{BatchReport, RateLimitReport, RefreshOutcome, TokenRefreshCoordinator};
use std::sync::Arc;
use tether_core_classify::ErrorKind;
use tether_core_health::store::SuccessMeta;
use tether_core_health::{
    ConsolidatedStatus, CredentialStore, HealthRepository, HealthStatus, HealthStatusStore,
    LogSink, MemoryHealthRepository, NotificationSink, Provider,
};
use tracing::debug;

/// All injected collaborators in one place, so construction sites stay
/// readable as deployments swap implementations in and out.
pub struct Collaborators {
    pub repository: Arc<dyn HealthRepository>,
    pub credentials: Arc<dyn CredentialStore>,
    pub factory: Arc<dyn ProviderClientFactory>,
    pub sink: Arc<dyn NotificationSink>,
    pub queue: Arc<dyn TaskQueue>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Sensible defaults around the two collaborators that have no default:
    /// in-memory health records, log-only sink and queue, system clock.
    pub fn with_defaults(
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn ProviderClientFactory>,
    ) -> Self {
        Self {
            repository: Arc::new(MemoryHealthRepository::new()),
            credentials,
            factory,
            sink: Arc::new(LogSink),
            queue: Arc::new(LogQueue),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The connection health and token refresh engine
pub struct Engine {
    store: Arc<HealthStatusStore>,
    coordinator: Arc<TokenRefreshCoordinator>,
    recovery: RecoveryEngine,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let Collaborators {
            repository,
            credentials,
            factory,
            sink,
            queue,
            clock,
        } = collaborators;

        let store = Arc::new(HealthStatusStore::new(
            repository,
            credentials.clone(),
            sink,
            config.store_config(),
        ));
        let coordinator = Arc::new(TokenRefreshCoordinator::new(
            store.clone(),
            credentials,
            factory,
            clock.clone(),
            config.clone(),
        ));
        let recovery = RecoveryEngine::new(
            coordinator.clone(),
            store.clone(),
            queue,
            clock.clone(),
            config,
        );

        Self {
            store,
            coordinator,
            recovery,
            clock,
        }
    }

    /// Fetch the health record for a pair, creating it lazily
    pub async fn get_or_create_health_status(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<HealthStatus, EngineError> {
        Ok(self
            .store
            .get_or_create(user_id, provider, self.clock.now())
            .await?)
    }

    /// Ensure a usable access token, refreshing if needed.
    ///
    /// On a provider failure the recovery engine is dispatched for follow-up
    /// before the classified error is returned; callers see the error either
    /// way, with retry handling already scheduled behind the scenes.
    pub async fn ensure_valid_token(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<RefreshOutcome, EngineError> {
        match self.coordinator.ensure_valid(user_id, provider).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Some(kind) = err.kind() {
                    let outcome = self
                        .recovery
                        .attempt_recovery(user_id, provider, kind, FailureContext::RefreshFailure)
                        .await?;
                    debug!(?outcome, "post-failure recovery dispatched");
                }
                Err(err)
            }
        }
    }

    /// Record a successful provider operation performed outside the engine
    pub async fn record_successful_operation(
        &self,
        user_id: &str,
        provider: Provider,
        operation: &str,
    ) -> Result<HealthStatus, EngineError> {
        Ok(self
            .store
            .record_success(
                user_id,
                provider,
                SuccessMeta {
                    token_expires_at: None,
                    operation: Some(operation.to_string()),
                },
                self.clock.now(),
            )
            .await?)
    }

    /// Record a hard operation failure and drive recovery for it.
    ///
    /// Returns the recovery outcome so callers know whether the connection
    /// came back (an expired token resolved by a forced refresh) or what the
    /// retry schedule looks like.
    pub async fn mark_unhealthy(
        &self,
        user_id: &str,
        provider: Provider,
        message: &str,
        kind: ErrorKind,
    ) -> Result<RecoveryOutcome, EngineError> {
        self.store
            .mark_unhealthy(user_id, provider, message, kind, self.clock.now())
            .await?;
        self.recovery
            .attempt_recovery(user_id, provider, kind, FailureContext::OperationFailure)
            .await
    }

    /// Rate limiter state for a pair, per operation
    pub fn get_rate_limit_status(&self, user_id: &str, provider: Provider) -> RateLimitReport {
        self.coordinator.rate_limit_report(user_id, provider)
    }

    /// The user-facing health value derived from record plus live credential
    pub async fn determine_consolidated_status(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<ConsolidatedStatus, EngineError> {
        Ok(self
            .store
            .determine_consolidated(user_id, provider, self.clock.now())
            .await?)
    }

    /// Maintenance: repair drifted health records from credential ground
    /// truth. Returns the number fixed.
    pub async fn reconcile_inconsistencies(&self) -> Result<usize, EngineError> {
        Ok(self
            .store
            .reconcile_inconsistencies(self.clock.now())
            .await?)
    }

    /// Batch refresh across a provider's expiring credentials
    pub async fn process_batch_refresh(
        &self,
        provider: Provider,
        window_hours: u64,
        batch_size: usize,
        dry_run: bool,
    ) -> Result<BatchReport, EngineError> {
        self.coordinator
            .process_batch(provider, window_hours, batch_size, dry_run)
            .await
    }

    /// Cheap cached connectivity probe
    pub async fn check_connectivity(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<bool, EngineError> {
        self.coordinator.check_connectivity(user_id, provider).await
    }

    /// The user supplied a fresh credential; clear sticky reconnection state
    /// and drop stale cached checks
    pub async fn credential_replaced(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<HealthStatus, EngineError> {
        self.coordinator.invalidate_checks(user_id, provider);
        Ok(self
            .store
            .credential_replaced(user_id, provider, self.clock.now())
            .await?)
    }

    /// Maintenance: evict stale pooled clients
    pub async fn optimize_pool(&self) -> usize {
        self.coordinator.optimize_pool().await
    }

    /// Pre-build provider clients ahead of a batch run
    pub async fn warm_up(&self, user_ids: &[String], provider: Provider) -> usize {
        self.coordinator.warm_up(user_ids, provider).await
    }

    /// Direct access for embedders needing more than the facade
    pub fn store(&self) -> &Arc<HealthStatusStore> {
        &self.store
    }

    /// Direct access for embedders needing more than the facade
    pub fn coordinator(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.coordinator
    }

    /// Direct access for embedders needing more than the facade
    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }
}
