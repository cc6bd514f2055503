//! Tether Core Health: the connection health state machine
//!
//! # Overview
//!
//! One [`HealthStatus`] record exists per (user, provider) connection. It is
//! the single source of truth for "is this connection usable", mutated only
//! through [`store::HealthStatusStore`], which enforces the record's
//! invariants and optimistic-concurrency discipline.
//!
//! The raw [`ConnectionStatus`] cycles freely among five states; there is no
//! terminal state. `NotConnected` is the initial state when no credential
//! exists, and `AuthenticationRequired` is sticky until an explicit
//! reconnection supplies a fresh credential.
//!
//! ```text
//!               record_success
//!        ┌──────────────────────────┐
//!        ▼                          │
//!   ┌─────────┐  transient    ┌──────────┐  threshold   ┌───────────┐
//!   │ Healthy │─────────────► │ Degraded │────────────► │ Unhealthy │
//!   └────┬────┘   failure     └──────────┘  exceeded    └─────┬─────┘
//!        │                                                    │
//!        │ auth-class failure                                 │
//!        ▼                                                    │
//!   ┌────────────────────────┐      credential_replaced       │
//!   │ AuthenticationRequired │◄────────────────────────────── ┘
//!   └────────────────────────┘     (sticky until then)
//! ```
//!
//! # Invariants
//!
//! Enforced by the store on every write, checked by
//! [`HealthStatus::invariants_hold`] and repaired by
//! [`store::HealthStatusStore::reconcile_inconsistencies`]:
//!
//! 1. `Healthy` implies no reconnection flag and no stored error.
//! 2. `Healthy` implies the token-expiry mirror is absent or in the future.
//! 3. A set reconnection flag implies a non-healthy status.
//! 4. `Healthy` implies zero consecutive failures.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tether_core_classify::ErrorKind;

pub mod credentials;
pub mod notify;
pub mod repository;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use credentials::{Credential, CredentialStore, MemoryCredentialStore};
pub use notify::{HealthEvent, LogSink, NotificationSink};
pub use repository::{HealthRepository, MemoryHealthRepository};
pub use store::{HealthStatusStore, StoreConfig, SuccessMeta};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHealthRepository;

/// Supported cloud-storage providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    GoogleDrive,
    Dropbox,
    OneDrive,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::GoogleDrive => write!(f, "google_drive"),
            Provider::Dropbox => write!(f, "dropbox"),
            Provider::OneDrive => write!(f, "one_drive"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google_drive" => Ok(Provider::GoogleDrive),
            "dropbox" => Ok(Provider::Dropbox),
            "one_drive" => Ok(Provider::OneDrive),
            other => Err(anyhow::anyhow!("unknown provider: {}", other)),
        }
    }
}

/// Raw connection status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Last interaction with the provider succeeded
    Healthy,
    /// Failing transiently; expected to self-heal
    Degraded,
    /// Repeated failures past the threshold
    Unhealthy,
    /// Automatic refresh cannot help; the user must reconnect
    AuthenticationRequired,
    /// No credential exists for this pair
    NotConnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Healthy => write!(f, "healthy"),
            ConnectionStatus::Degraded => write!(f, "degraded"),
            ConnectionStatus::Unhealthy => write!(f, "unhealthy"),
            ConnectionStatus::AuthenticationRequired => write!(f, "authentication_required"),
            ConnectionStatus::NotConnected => write!(f, "not_connected"),
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(ConnectionStatus::Healthy),
            "degraded" => Ok(ConnectionStatus::Degraded),
            "unhealthy" => Ok(ConnectionStatus::Unhealthy),
            "authentication_required" => Ok(ConnectionStatus::AuthenticationRequired),
            "not_connected" => Ok(ConnectionStatus::NotConnected),
            other => Err(anyhow::anyhow!("unknown connection status: {}", other)),
        }
    }
}

/// The single user-facing health value, derived from raw status plus live
/// credential expiry so the UI never shows contradictory signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidatedStatus {
    /// Usable, token valid beyond the lookahead window
    Connected,
    /// Usable, but the token enters the proactive-refresh window
    ExpiringSoon,
    /// The token is already expired; a refresh is due
    RefreshOverdue,
    /// Transiently failing; expected to self-heal without user action
    Degraded,
    /// Only a user-supplied fresh credential can restore service
    ReconnectRequired,
    /// No credential on file
    NotConnected,
}

impl fmt::Display for ConsolidatedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsolidatedStatus::Connected => write!(f, "connected"),
            ConsolidatedStatus::ExpiringSoon => write!(f, "expiring_soon"),
            ConsolidatedStatus::RefreshOverdue => write!(f, "refresh_overdue"),
            ConsolidatedStatus::Degraded => write!(f, "degraded"),
            ConsolidatedStatus::ReconnectRequired => write!(f, "reconnect_required"),
            ConsolidatedStatus::NotConnected => write!(f, "not_connected"),
        }
    }
}

impl std::str::FromStr for ConsolidatedStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(ConsolidatedStatus::Connected),
            "expiring_soon" => Ok(ConsolidatedStatus::ExpiringSoon),
            "refresh_overdue" => Ok(ConsolidatedStatus::RefreshOverdue),
            "degraded" => Ok(ConsolidatedStatus::Degraded),
            "reconnect_required" => Ok(ConsolidatedStatus::ReconnectRequired),
            "not_connected" => Ok(ConsolidatedStatus::NotConnected),
            other => Err(anyhow::anyhow!("unknown consolidated status: {}", other)),
        }
    }
}

/// Health record for one (user, provider) connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub user_id: String,
    pub provider: Provider,
    pub status: ConnectionStatus,
    /// Derived summary; recomputed by the store, never hand-set
    pub consolidated: ConsolidatedStatus,
    pub consecutive_failures: u32,
    pub requires_reconnection: bool,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    /// Mirror of the credential's expiry, synced on every successful refresh
    pub token_expires_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token; bumped by the repository on every write
    pub version: u64,
}

impl HealthStatus {
    /// Create the initial record for a pair with no credential
    pub fn new(user_id: impl Into<String>, provider: Provider, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            provider,
            status: ConnectionStatus::NotConnected,
            consolidated: ConsolidatedStatus::NotConnected,
            consecutive_failures: 0,
            requires_reconnection: false,
            last_error_kind: None,
            last_error_message: None,
            token_expires_at: None,
            last_success_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Transition for a successful operation or refresh.
    ///
    /// Clears all failure bookkeeping. A stale expiry mirror with no
    /// replacement is dropped rather than left contradicting `Healthy`.
    pub fn apply_success(&mut self, now: DateTime<Utc>, token_expires_at: Option<DateTime<Utc>>) {
        self.status = ConnectionStatus::Healthy;
        self.consecutive_failures = 0;
        self.requires_reconnection = false;
        self.last_error_kind = None;
        self.last_error_message = None;
        self.last_success_at = Some(now);
        if let Some(expires_at) = token_expires_at {
            self.token_expires_at = Some(expires_at);
        } else if matches!(self.token_expires_at, Some(exp) if exp <= now) {
            self.token_expires_at = None;
        }
        self.updated_at = now;
    }

    /// Transition for a failed operation or refresh.
    ///
    /// The target status is a deterministic function of the error kind's
    /// metadata: reconnection-class kinds park the record in
    /// `AuthenticationRequired`; everything else degrades, escalating to
    /// `Unhealthy` once `unhealthy_threshold` consecutive failures accumulate
    /// (or immediately when forced by the caller).
    pub fn apply_failure(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        now: DateTime<Utc>,
        unhealthy_threshold: u32,
        force_unhealthy: bool,
    ) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error_kind = Some(kind);
        self.last_error_message = Some(message.into());

        if kind.metadata().requires_reconnection {
            self.requires_reconnection = true;
            self.status = ConnectionStatus::AuthenticationRequired;
        } else if force_unhealthy || self.consecutive_failures >= unhealthy_threshold {
            self.status = ConnectionStatus::Unhealthy;
        } else {
            self.status = ConnectionStatus::Degraded;
        }
        self.updated_at = now;
    }

    /// Check the four record invariants against `now`
    pub fn invariants_hold(&self, now: DateTime<Utc>) -> bool {
        if self.status == ConnectionStatus::Healthy {
            if self.requires_reconnection || self.last_error_kind.is_some() {
                return false;
            }
            if self.consecutive_failures != 0 {
                return false;
            }
            if matches!(self.token_expires_at, Some(exp) if exp <= now) {
                return false;
            }
        }
        if self.requires_reconnection && self.status == ConnectionStatus::Healthy {
            return false;
        }
        true
    }
}

/// Derive the consolidated status from a record plus credential ground truth.
///
/// Precedence (highest first): reconnect needed, no credential, token
/// expired, token expiring, degraded/unhealthy, connected.
pub fn consolidate(
    status: ConnectionStatus,
    requires_reconnection: bool,
    credential_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookahead: Duration,
) -> ConsolidatedStatus {
    if requires_reconnection || status == ConnectionStatus::AuthenticationRequired {
        return ConsolidatedStatus::ReconnectRequired;
    }

    let expires_at = match credential_expires_at {
        None => return ConsolidatedStatus::NotConnected,
        Some(exp) => exp,
    };

    if expires_at <= now {
        return ConsolidatedStatus::RefreshOverdue;
    }
    if expires_at <= now + chrono::Duration::seconds(lookahead.as_secs() as i64) {
        return ConsolidatedStatus::ExpiringSoon;
    }

    match status {
        ConnectionStatus::Degraded | ConnectionStatus::Unhealthy => ConsolidatedStatus::Degraded,
        // A credential exists, so "not connected" is stale; surface degraded
        // until a check confirms the connection
        ConnectionStatus::NotConnected => ConsolidatedStatus::Degraded,
        ConnectionStatus::Healthy | ConnectionStatus::AuthenticationRequired => {
            ConsolidatedStatus::Connected
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

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    #[test]
    fn initial_record_is_not_connected() {
        let record = HealthStatus::new("u1", Provider::GoogleDrive, t0());
        assert_eq!(record.status, ConnectionStatus::NotConnected);
        assert_eq!(record.consecutive_failures, 0);
        assert!(!record.requires_reconnection);
        assert!(record.invariants_hold(t0()));
    }

    #[test]
    fn invariants_hold_across_arbitrary_sequences() {
        let now = t0();
        let sequences: &[&[Option<ErrorKind>]] = &[
            // None = success, Some(kind) = failure
            &[None, Some(ErrorKind::NetworkError), None],
            &[Some(ErrorKind::InvalidRefreshToken), None, Some(ErrorKind::ApiQuotaExceeded)],
            &[
                Some(ErrorKind::NetworkError),
                Some(ErrorKind::NetworkError),
                Some(ErrorKind::NetworkError),
                Some(ErrorKind::ServiceUnavailable),
            ],
            &[None, None, Some(ErrorKind::TokenExpired), Some(ErrorKind::UnknownError), None],
        ];

        for sequence in sequences {
            let mut record = HealthStatus::new("u1", Provider::GoogleDrive, now);
            for step in *sequence {
                match step {
                    None => record.apply_success(now, Some(now + hours(48))),
                    Some(kind) => record.apply_failure(*kind, "boom", now, 3, false),
                }
                assert!(record.invariants_hold(now), "violated after {:?}", step);
            }
        }
    }

    #[test]
    fn success_clears_failure_bookkeeping() {
        let now = t0();
        let mut record = HealthStatus::new("u1", Provider::GoogleDrive, now);
        record.apply_failure(ErrorKind::InvalidRefreshToken, "expired", now, 3, false);
        assert_eq!(record.status, ConnectionStatus::AuthenticationRequired);
        assert!(record.requires_reconnection);
        assert_eq!(record.consecutive_failures, 1);

        record.apply_success(now, Some(now + hours(24)));
        assert_eq!(record.status, ConnectionStatus::Healthy);
        assert!(!record.requires_reconnection);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_error_kind, None);
        assert_eq!(record.last_error_message, None);
    }

    #[test]
    fn transient_failures_escalate_at_threshold() {
        let now = t0();
        let mut record = HealthStatus::new("u1", Provider::Dropbox, now);

        record.apply_failure(ErrorKind::NetworkError, "reset", now, 3, false);
        assert_eq!(record.status, ConnectionStatus::Degraded);
        record.apply_failure(ErrorKind::NetworkError, "reset", now, 3, false);
        assert_eq!(record.status, ConnectionStatus::Degraded);
        record.apply_failure(ErrorKind::NetworkError, "reset", now, 3, false);
        assert_eq!(record.status, ConnectionStatus::Unhealthy);
        assert!(!record.requires_reconnection);
    }

    #[test]
    fn forced_unhealthy_skips_threshold() {
        let now = t0();
        let mut record = HealthStatus::new("u1", Provider::Dropbox, now);
        record.apply_failure(ErrorKind::ServiceUnavailable, "down", now, 3, true);
        assert_eq!(record.status, ConnectionStatus::Unhealthy);
    }

    #[test]
    fn success_drops_stale_expiry_mirror() {
        let now = t0();
        let mut record = HealthStatus::new("u1", Provider::GoogleDrive, now);
        record.token_expires_at = Some(now - hours(1));
        record.apply_success(now, None);
        assert_eq!(record.token_expires_at, None);
        assert!(record.invariants_hold(now));
    }

    #[test]
    fn consolidate_precedence() {
        let now = t0();
        let lookahead = Duration::from_secs(24 * 3600);

        // Reconnect beats everything
        assert_eq!(
            consolidate(ConnectionStatus::Degraded, true, Some(now + hours(48)), now, lookahead),
            ConsolidatedStatus::ReconnectRequired
        );
        // No credential
        assert_eq!(
            consolidate(ConnectionStatus::Healthy, false, None, now, lookahead),
            ConsolidatedStatus::NotConnected
        );
        // Expired credential
        assert_eq!(
            consolidate(ConnectionStatus::Healthy, false, Some(now - hours(1)), now, lookahead),
            ConsolidatedStatus::RefreshOverdue
        );
        // Inside lookahead
        assert_eq!(
            consolidate(ConnectionStatus::Healthy, false, Some(now + hours(12)), now, lookahead),
            ConsolidatedStatus::ExpiringSoon
        );
        // Degraded with a good token
        assert_eq!(
            consolidate(ConnectionStatus::Degraded, false, Some(now + hours(48)), now, lookahead),
            ConsolidatedStatus::Degraded
        );
        // Clean
        assert_eq!(
            consolidate(ConnectionStatus::Healthy, false, Some(now + hours(48)), now, lookahead),
            ConsolidatedStatus::Connected
        );
    }

    #[test]
    fn status_roundtrip() {
        use std::str::FromStr;
        for status in [
            ConnectionStatus::Healthy,
            ConnectionStatus::Degraded,
            ConnectionStatus::Unhealthy,
            ConnectionStatus::AuthenticationRequired,
            ConnectionStatus::NotConnected,
        ] {
            assert_eq!(ConnectionStatus::from_str(&status.to_string()).unwrap(), status);
        }
        assert!(ConnectionStatus::from_str("bogus").is_err());
    }
}
