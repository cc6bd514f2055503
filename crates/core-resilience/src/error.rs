//! Error types for the resilience primitives

use thiserror::Error;
use std::time::Duration;

/// Errors produced by the protection primitives
#[derive(Debug, Error, Clone)]
pub enum ResilienceError {
    /// The rolling window for this key is exhausted
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the window resets and attempts are allowed again
        retry_after: Duration,
    },

    /// Client construction failed
    #[error("failed to create client: {0}")]
    ClientCreation(String),

    /// The pool cannot admit another client
    #[error("client pool is at capacity with no evictable entry")]
    PoolExhausted,

    /// An operation exceeded its deadline
    #[error("operation timeout after {0:?}")]
    Timeout(Duration),
}

impl ResilienceError {
    /// Whether the caller can expect a later attempt to succeed unaided
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::RateLimited { .. }
                | ResilienceError::Timeout(_)
                | ResilienceError::PoolExhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let limited = ResilienceError::RateLimited {
            retry_after: Duration::from_secs(60),
        };
        assert!(limited.is_transient());

        let creation = ResilienceError::ClientCreation("bad credential".to_string());
        assert!(!creation.is_transient());
    }
}
