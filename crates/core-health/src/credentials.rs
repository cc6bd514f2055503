//! Credential access abstraction
//!
//! Credentials are owned by the surrounding account subsystem; the engine
//! reads and updates them through [`CredentialStore`] but never creates them
//! from nothing. A missing credential forces the connection into
//! `NotConnected`.

use crate::Provider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// OAuth-style token record for one (user, provider) pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl Credential {
    /// Stable digest identifying the credential a client was built from.
    ///
    /// Changes whenever the refresh token rotates, so pooled clients bound
    /// to a superseded credential age out naturally.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.provider.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(self.refresh_token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether the access token has already expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether the access token expires within `window` from `now`
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at <= now + chrono::Duration::seconds(window.as_secs() as i64)
    }
}

/// Read/write access to the externally owned credential records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the current credential for a pair, if any
    async fn load(&self, user_id: &str, provider: Provider) -> anyhow::Result<Option<Credential>>;

    /// Persist a refreshed credential
    async fn persist(&self, credential: &Credential) -> anyhow::Result<()>;

    /// All credentials for one provider (batch candidate selection)
    async fn list(&self, provider: Provider) -> anyhow::Result<Vec<Credential>>;
}

/// In-memory credential store for tests and embedded use
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<HashMap<(String, Provider), Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a credential, replacing any existing one for the pair
    pub fn put(&self, credential: Credential) {
        let mut inner = self.inner.lock().expect("credential store lock poisoned");
        inner.insert((credential.user_id.clone(), credential.provider), credential);
    }

    /// Remove the credential for a pair (simulates account disconnection)
    pub fn remove(&self, user_id: &str, provider: Provider) -> bool {
        let mut inner = self.inner.lock().expect("credential store lock poisoned");
        inner.remove(&(user_id.to_string(), provider)).is_some()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, user_id: &str, provider: Provider) -> anyhow::Result<Option<Credential>> {
        let inner = self.inner.lock().expect("credential store lock poisoned");
        Ok(inner.get(&(user_id.to_string(), provider)).cloned())
    }

    async fn persist(&self, credential: &Credential) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("credential store lock poisoned");
        inner.insert(
            (credential.user_id.clone(), credential.provider),
            credential.clone(),
        );
        Ok(())
    }

    async fn list(&self, provider: Provider) -> anyhow::Result<Vec<Credential>> {
        let inner = self.inner.lock().expect("credential store lock poisoned");
        Ok(inner
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect())
    }
}
