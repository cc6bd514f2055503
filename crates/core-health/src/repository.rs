//! Persistent storage of health records
//!
//! The repository is deliberately thin: load, insert-if-absent, versioned
//! compare-and-swap update, list, remove. All state-machine logic lives in
//! [`crate::store::HealthStatusStore`] so it is testable against the
//! in-memory backend without a database.

use crate::{HealthStatus, Provider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Storage backend for [`HealthStatus`] records.
///
/// Implementations must make `update` atomic with respect to the version
/// check; callers rely on it for optimistic concurrency.
#[async_trait]
pub trait HealthRepository: Send + Sync {
    /// Load the record for a pair, if present
    async fn load(&self, user_id: &str, provider: Provider) -> anyhow::Result<Option<HealthStatus>>;

    /// Insert `record` unless one already exists; returns the stored record
    /// (the existing one on a lost race). `get_or_create` builds on this.
    async fn insert_if_absent(&self, record: HealthStatus) -> anyhow::Result<HealthStatus>;

    /// Compare-and-swap update: commits `record` (with its version bumped)
    /// only if the stored version still equals `record.version`. Returns
    /// false on a version conflict.
    async fn update(&self, record: &HealthStatus) -> anyhow::Result<bool>;

    /// All records (reconciliation scans)
    async fn list(&self) -> anyhow::Result<Vec<HealthStatus>>;

    /// Remove a record (account-removal path). Returns true if one existed.
    async fn remove(&self, user_id: &str, provider: Provider) -> anyhow::Result<bool>;
}

/// In-memory repository; the default backend and the test harness.
#[derive(Debug, Default)]
pub struct MemoryHealthRepository {
    inner: Mutex<HashMap<(String, Provider), HealthStatus>>,
}

impl MemoryHealthRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthRepository for MemoryHealthRepository {
    async fn load(&self, user_id: &str, provider: Provider) -> anyhow::Result<Option<HealthStatus>> {
        let inner = self.inner.lock().expect("health repository lock poisoned");
        Ok(inner.get(&(user_id.to_string(), provider)).cloned())
    }

    async fn insert_if_absent(&self, record: HealthStatus) -> anyhow::Result<HealthStatus> {
        let mut inner = self.inner.lock().expect("health repository lock poisoned");
        let key = (record.user_id.clone(), record.provider);
        Ok(inner.entry(key).or_insert(record).clone())
    }

    async fn update(&self, record: &HealthStatus) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().expect("health repository lock poisoned");
        let key = (record.user_id.clone(), record.provider);
        match inner.get_mut(&key) {
            Some(stored) if stored.version == record.version => {
                let mut committed = record.clone();
                committed.version = record.version + 1;
                *stored = committed;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn list(&self) -> anyhow::Result<Vec<HealthStatus>> {
        let inner = self.inner.lock().expect("health repository lock poisoned");
        Ok(inner.values().cloned().collect())
    }

    async fn remove(&self, user_id: &str, provider: Provider) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().expect("health repository lock poisoned");
        Ok(inner.remove(&(user_id.to_string(), provider)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(user: &str) -> HealthStatus {
        HealthStatus::new(
            user,
            Provider::GoogleDrive,
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_if_absent_is_idempotent() {
        let repo = MemoryHealthRepository::new();

        let first = repo.insert_if_absent(record("u1")).await.unwrap();
        let mut changed = record("u1");
        changed.consecutive_failures = 9;
        let second = repo.insert_if_absent(changed).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_enforces_version() {
        let repo = MemoryHealthRepository::new();
        let stored = repo.insert_if_absent(record("u1")).await.unwrap();

        let mut fresh = stored.clone();
        fresh.consecutive_failures = 1;
        assert!(repo.update(&fresh).await.unwrap());

        // Same (now stale) version loses
        let mut stale = stored;
        stale.consecutive_failures = 7;
        assert!(!repo.update(&stale).await.unwrap());

        let current = repo.load("u1", Provider::GoogleDrive).await.unwrap().unwrap();
        assert_eq!(current.consecutive_failures, 1);
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn update_missing_record_fails() {
        let repo = MemoryHealthRepository::new();
        assert!(!repo.update(&record("ghost")).await.unwrap());
    }

    #[tokio::test]
    async fn remove_record() {
        let repo = MemoryHealthRepository::new();
        repo.insert_if_absent(record("u1")).await.unwrap();
        assert!(repo.remove("u1", Provider::GoogleDrive).await.unwrap());
        assert!(!repo.remove("u1", Provider::GoogleDrive).await.unwrap());
        assert!(repo.load("u1", Provider::GoogleDrive).await.unwrap().is_none());
    }
}
