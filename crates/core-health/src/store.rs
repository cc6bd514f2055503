//! HealthStatusStore: the only writer of health records
//!
//! Callers never mutate a [`HealthStatus`] directly. Every write goes through
//! the store's read-modify-CAS-write loop keyed on the record's `version`,
//! which keeps transitions linearizable per (user, provider) pair without
//! holding a lock across the slow provider calls happening elsewhere.
//!
//! The store also owns drift repair: [`HealthStatusStore::reconcile_inconsistencies`]
//! recomputes records from credential ground truth instead of trusting the
//! stored flags. This is an explicit self-healing pass, not a normal write
//! path.

use crate::credentials::CredentialStore;
use crate::notify::{HealthEvent, NotificationSink};
use crate::repository::HealthRepository;
use crate::{consolidate, ConnectionStatus, ConsolidatedStatus, HealthStatus, Provider};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tether_core_classify::ErrorKind;
use tracing::{debug, info, instrument};

/// Tunables for the store's transition and repair behavior
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Consecutive transient failures before `Degraded` escalates to `Unhealthy`
    pub unhealthy_threshold: u32,
    /// Window used when deriving `ExpiringSoon`
    pub expiry_lookahead: Duration,
    /// Bounded retries of the CAS loop before giving up
    pub max_update_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            expiry_lookahead: Duration::from_secs(24 * 3600),
            max_update_retries: 5,
        }
    }
}

/// Optional context recorded alongside a success
#[derive(Debug, Clone, Default)]
pub struct SuccessMeta {
    /// New token expiry to mirror (set after a refresh)
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Operation name, for the log line only
    pub operation: Option<String>,
}

/// Persisted state machine for connection health
pub struct HealthStatusStore {
    repository: Arc<dyn HealthRepository>,
    credentials: Arc<dyn CredentialStore>,
    sink: Arc<dyn NotificationSink>,
    config: StoreConfig,
}

impl HealthStatusStore {
    pub fn new(
        repository: Arc<dyn HealthRepository>,
        credentials: Arc<dyn CredentialStore>,
        sink: Arc<dyn NotificationSink>,
        config: StoreConfig,
    ) -> Self {
        Self {
            repository,
            credentials,
            sink,
            config,
        }
    }

    /// Fetch the record for a pair, creating it lazily on first contact.
    ///
    /// Creation consults credential ground truth: a valid credential starts
    /// the record `Healthy`, an expired one `Degraded`, none `NotConnected`.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        if let Some(existing) = self.repository.load(user_id, provider).await? {
            return Ok(existing);
        }

        let credential = self.credentials.load(user_id, provider).await?;
        let mut record = HealthStatus::new(user_id, provider, now);
        match &credential {
            Some(cred) if cred.expires_at > now => {
                record.status = ConnectionStatus::Healthy;
                record.token_expires_at = Some(cred.expires_at);
            }
            Some(cred) => {
                record.status = ConnectionStatus::Degraded;
                record.token_expires_at = Some(cred.expires_at);
            }
            None => {}
        }
        record.consolidated = consolidate(
            record.status,
            record.requires_reconnection,
            credential.as_ref().map(|c| c.expires_at),
            now,
            self.config.expiry_lookahead,
        );

        debug!(%user_id, %provider, status = %record.status, "created health record");
        self.repository.insert_if_absent(record).await
    }

    /// Record a successful operation or refresh
    #[instrument(skip(self, meta), fields(%user_id, %provider))]
    pub async fn record_success(
        &self,
        user_id: &str,
        provider: Provider,
        meta: SuccessMeta,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        let (before, after) = self
            .mutate(user_id, provider, now, |record| {
                record.apply_success(now, meta.token_expires_at);
            })
            .await?;

        if let Some(op) = &meta.operation {
            debug!(operation = %op, "recorded successful operation");
        }
        self.dispatch_events(&before, &after).await;
        Ok(after)
    }

    /// Record a classified failure
    #[instrument(skip(self, message), fields(%user_id, %provider, %kind))]
    pub async fn record_failure(
        &self,
        user_id: &str,
        provider: Provider,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        let threshold = self.config.unhealthy_threshold;
        let (before, after) = self
            .mutate(user_id, provider, now, |record| {
                record.apply_failure(kind, message, now, threshold, false);
            })
            .await?;

        self.dispatch_events(&before, &after).await;
        Ok(after)
    }

    /// Force a connection to `Unhealthy` regardless of failure count.
    ///
    /// Entry point for the surrounding application when an upload operation
    /// fails hard outside the refresh path.
    pub async fn mark_unhealthy(
        &self,
        user_id: &str,
        provider: Provider,
        message: &str,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        let threshold = self.config.unhealthy_threshold;
        let (before, after) = self
            .mutate(user_id, provider, now, |record| {
                record.apply_failure(kind, message, now, threshold, true);
            })
            .await?;

        self.dispatch_events(&before, &after).await;
        Ok(after)
    }

    /// Convert an exhausted retryable failure into a sticky reconnection.
    ///
    /// Used by the recovery engine once the max-attempt ceiling is reached,
    /// so "retryable" can never mean "retried silently forever".
    pub async fn escalate_to_reconnection(
        &self,
        user_id: &str,
        provider: Provider,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        let reason = reason.to_string();
        let (before, after) = self
            .mutate(user_id, provider, now, move |record| {
                record.requires_reconnection = true;
                if record.status == ConnectionStatus::Healthy
                    || record.status == ConnectionStatus::NotConnected
                {
                    record.status = ConnectionStatus::Unhealthy;
                }
                record.last_error_message = Some(reason.clone());
                record.updated_at = now;
            })
            .await?;

        self.dispatch_events(&before, &after).await;
        Ok(after)
    }

    /// Clear the sticky reconnection state after the user supplied a fresh
    /// credential. The record restarts from credential ground truth.
    pub async fn credential_replaced(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> anyhow::Result<HealthStatus> {
        let credential = self.credentials.load(user_id, provider).await?;
        let expires_at = credential.as_ref().map(|c| c.expires_at);

        let (before, after) = self
            .mutate(user_id, provider, now, move |record| {
                record.requires_reconnection = false;
                record.consecutive_failures = 0;
                record.last_error_kind = None;
                record.last_error_message = None;
                record.token_expires_at = expires_at;
                record.status = match expires_at {
                    Some(exp) if exp > now => ConnectionStatus::Healthy,
                    Some(_) => ConnectionStatus::Degraded,
                    None => ConnectionStatus::NotConnected,
                };
                if record.status == ConnectionStatus::Healthy {
                    record.last_success_at = Some(now);
                }
                record.updated_at = now;
            })
            .await?;

        info!(%user_id, %provider, "credential replaced, reconnection flag cleared");
        self.dispatch_events(&before, &after).await;
        Ok(after)
    }

    /// Derive the consolidated status from the stored record plus the live
    /// credential. Pure with respect to stored state: nothing is written.
    pub async fn determine_consolidated(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ConsolidatedStatus> {
        let record = self.get_or_create(user_id, provider, now).await?;
        let credential = self.credentials.load(user_id, provider).await?;
        Ok(consolidate(
            record.status,
            record.requires_reconnection,
            credential.map(|c| c.expires_at),
            now,
            self.config.expiry_lookahead,
        ))
    }

    /// Scan all records, repair invariant violations and drift against
    /// credential ground truth. Returns the number of records corrected.
    ///
    /// This single pass subsumes the two historical repair commands: the
    /// consolidated-status overwrite and the token-expiry mirror sync.
    #[instrument(skip(self))]
    pub async fn reconcile_inconsistencies(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let records = self.repository.list().await?;
        let mut fixed = 0;

        for record in records {
            let credential = self
                .credentials
                .load(&record.user_id, record.provider)
                .await?;
            let expires_at = credential.as_ref().map(|c| c.expires_at);

            let corrected = reconcile_record(&record, expires_at, now, &self.config);
            let Some(corrected) = corrected else {
                continue;
            };

            if self.repository.update(&corrected).await? {
                info!(
                    user_id = %corrected.user_id,
                    provider = %corrected.provider,
                    status = %corrected.status,
                    "repaired inconsistent health record"
                );
                fixed += 1;
            }
            // A lost CAS means a concurrent writer just rewrote the record;
            // its write is newer ground truth than our correction.
        }

        Ok(fixed)
    }

    /// Remove the record for a pair (account-removal path)
    pub async fn remove(&self, user_id: &str, provider: Provider) -> anyhow::Result<bool> {
        self.repository.remove(user_id, provider).await
    }

    /// All records, for reporting
    pub async fn list(&self) -> anyhow::Result<Vec<HealthStatus>> {
        self.repository.list().await
    }

    /// Read-modify-CAS-write loop with bounded retries.
    ///
    /// Returns the record before and after the committed mutation. The
    /// consolidated field is recomputed on every attempt from the live
    /// credential so it can never be hand-set inconsistently.
    async fn mutate<F>(
        &self,
        user_id: &str,
        provider: Provider,
        now: DateTime<Utc>,
        apply: F,
    ) -> anyhow::Result<(HealthStatus, HealthStatus)>
    where
        F: Fn(&mut HealthStatus),
    {
        for attempt in 0..self.config.max_update_retries {
            let current = self.get_or_create(user_id, provider, now).await?;
            let credential = self.credentials.load(user_id, provider).await?;

            let mut updated = current.clone();
            apply(&mut updated);
            updated.consolidated = consolidate(
                updated.status,
                updated.requires_reconnection,
                credential.as_ref().map(|c| c.expires_at),
                now,
                self.config.expiry_lookahead,
            );
            debug_assert!(
                updated.invariants_hold(now),
                "transition produced an invariant violation: {:?}",
                updated
            );

            if self
                .repository
                .update(&updated)
                .await
                .context("health repository update failed")?
            {
                let mut committed = updated;
                committed.version = current.version + 1;
                return Ok((current, committed));
            }

            debug!(%user_id, %provider, attempt, "health update lost CAS race, retrying");
        }

        bail!(
            "health record for {user_id}/{provider} contended beyond {} retries",
            self.config.max_update_retries
        );
    }

    /// Fire notifications for the transitions the messaging subsystem cares
    /// about. Failures to deliver are the sink's problem, not ours.
    async fn dispatch_events(&self, before: &HealthStatus, after: &HealthStatus) {
        if !before.requires_reconnection && after.requires_reconnection {
            self.sink
                .notify(HealthEvent::ReconnectionRequired {
                    user_id: after.user_id.clone(),
                    provider: after.provider,
                    kind: after.last_error_kind,
                    message: after.last_error_message.clone(),
                })
                .await;
        }

        let was_broken = matches!(
            before.status,
            ConnectionStatus::Degraded
                | ConnectionStatus::Unhealthy
                | ConnectionStatus::AuthenticationRequired
        );
        if was_broken && after.status == ConnectionStatus::Healthy {
            self.sink
                .notify(HealthEvent::Recovered {
                    user_id: after.user_id.clone(),
                    provider: after.provider,
                })
                .await;
        }
    }
}

/// Compute the corrected form of a drifted record, or None if it is clean.
///
/// Ground truth is the credential: stored flags are recomputed, never
/// trusted, mirroring the repair semantics of the reconcile pass.
fn reconcile_record(
    record: &HealthStatus,
    credential_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &StoreConfig,
) -> Option<HealthStatus> {
    let mut corrected = record.clone();

    match credential_expires_at {
        None => {
            // No credential: the only truthful status is NotConnected
            if corrected.status != ConnectionStatus::NotConnected {
                corrected.status = ConnectionStatus::NotConnected;
                corrected.requires_reconnection = false;
                corrected.token_expires_at = None;
            }
        }
        Some(expires_at) => {
            // Sync the expiry mirror
            if corrected.token_expires_at != Some(expires_at) {
                corrected.token_expires_at = Some(expires_at);
            }
            if corrected.status == ConnectionStatus::Healthy {
                if expires_at <= now {
                    // Healthy with an expired token is a lie
                    corrected.status = ConnectionStatus::Degraded;
                } else if corrected.requires_reconnection
                    || corrected.last_error_kind.is_some()
                    || corrected.consecutive_failures > 0
                {
                    // Healthy status with failure residue: the credential is
                    // fine, so the residue is the stale part
                    corrected.requires_reconnection = false;
                    corrected.last_error_kind = None;
                    corrected.last_error_message = None;
                    corrected.consecutive_failures = 0;
                }
            }
        }
    }

    corrected.consolidated = consolidate(
        corrected.status,
        corrected.requires_reconnection,
        credential_expires_at,
        now,
        config.expiry_lookahead,
    );

    if corrected.status == record.status
        && corrected.consolidated == record.consolidated
        && corrected.requires_reconnection == record.requires_reconnection
        && corrected.token_expires_at == record.token_expires_at
        && corrected.last_error_kind == record.last_error_kind
        && corrected.consecutive_failures == record.consecutive_failures
    {
        return None;
    }

    corrected.updated_at = now;
    Some(corrected)
}
