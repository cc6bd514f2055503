//! Provider client abstraction
//!
//! OAuth handshake mechanics and transport live behind these traits; the
//! engine only ever sees an opaque, already-authenticated client. Each
//! provider integration supplies a [`ProviderClientFactory`], and the
//! coordinator pools the clients it builds, keyed by credential fingerprint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tether_core_health::Credential;
use thiserror::Error;

/// Raw error surfaced by a provider integration.
///
/// Deliberately unstructured: the classifier turns it into an
/// [`tether_core_classify::ErrorKind`] before anyone else sees it.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    pub http_status: Option<u16>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            http_status: Some(status),
        }
    }
}

/// Result of a successful provider token refresh
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// An authenticated API client for one provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Exchange the refresh token for a fresh access token
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshedToken, ProviderError>;

    /// Cheap connectivity probe (an `about`-style call)
    async fn probe(&self) -> Result<(), ProviderError>;
}

/// Constructs authenticated clients from credentials
#[async_trait]
pub trait ProviderClientFactory: Send + Sync {
    async fn build(&self, credential: &Credential)
        -> Result<Arc<dyn ProviderClient>, ProviderError>;
}
