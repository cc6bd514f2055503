//! Engine error types
//!
//! Two families, kept firmly apart:
//!
//! - **Classified provider failures** ([`EngineError::Provider`]) — the
//!   provider said no, and the classifier decided what that means. Callers
//!   never see a raw provider error.
//! - **Operational signals** ([`EngineError::RateLimited`],
//!   [`EngineError::NotConnected`]) — control flow, not provider failures.
//!   They never increment failure counters, and a rate-limit denial carries
//!   `retry_after` so callers can schedule instead of poll.
//!
//! The non-error short circuits (`AlreadyRefreshed`, cache hits) are not
//! errors at all; they live in [`crate::refresh::RefreshOutcome`].

use crate::refresh::Operation;
use std::time::Duration;
use tether_core_classify::ErrorKind;
use tether_core_health::Provider;
use thiserror::Error;

/// Errors surfaced by the engine's public operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// No credential exists for this pair; there is nothing to refresh
    #[error("no credential stored for {user_id} on {provider}")]
    NotConnected { user_id: String, provider: Provider },

    /// Back-pressure from the per-pair attempt window
    #[error("{operation} rate limited, retry after {retry_after:?}")]
    RateLimited {
        operation: Operation,
        retry_after: Duration,
    },

    /// A provider failure, already classified
    #[error("provider failure ({kind}): {message}")]
    Provider { kind: ErrorKind, message: String },

    /// Repository or collaborator failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// The classified kind, when this is a provider failure
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::Provider { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a later attempt can plausibly succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::NotConnected { .. } => false,
            EngineError::RateLimited { .. } => true,
            EngineError::Provider { kind, .. } => kind.is_retryable(),
            EngineError::Internal(_) => true,
        }
    }

    /// The retry hint for back-pressure errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable_with_hint() {
        let err = EngineError::RateLimited {
            operation: Operation::TokenRefresh,
            retry_after: Duration::from_secs(120),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(120)));
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn provider_error_carries_kind() {
        let err = EngineError::Provider {
            kind: ErrorKind::InvalidRefreshToken,
            message: "invalid_grant".to_string(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::InvalidRefreshToken));
        assert!(!err.is_retryable());
    }
}
