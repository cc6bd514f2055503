//! Shared test harness: a fake provider, recording collaborators, and an
//! engine wired over in-memory stores with a manually advanced clock.

// Each integration binary uses a different slice of this harness.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether::provider::{ProviderClient, ProviderClientFactory, ProviderError, RefreshedToken};
use tether::recovery::{RetryTask, TaskQueue};
use tether::{Collaborators, Engine, EngineConfig, ManualClock, Provider};
use tether_core_health::repository::MemoryHealthRepository;
use tether_core_health::{Credential, HealthEvent, MemoryCredentialStore, NotificationSink};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn hours(h: i64) -> chrono::Duration {
    chrono::Duration::hours(h)
}

pub fn credential(user: &str, provider: Provider, expires_at: DateTime<Utc>) -> Credential {
    Credential {
        user_id: user.to_string(),
        provider,
        access_token: format!("at-{user}"),
        refresh_token: format!("rt-{user}"),
        expires_at,
        scopes: vec!["drive.file".to_string()],
    }
}

/// Shared state steering the fake provider's behavior
pub struct FakeProviderState {
    pub refresh_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub build_calls: AtomicUsize,
    /// Scripted refresh results; when empty, refreshes succeed with
    /// `default_expiry`
    pub refresh_results: Mutex<VecDeque<Result<RefreshedToken, ProviderError>>>,
    /// Scripted probe results; when empty, probes succeed
    pub probe_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    pub default_expiry: Mutex<DateTime<Utc>>,
    /// Artificial latency per refresh call, for concurrency tests
    pub refresh_delay: Mutex<Option<Duration>>,
}

impl FakeProviderState {
    pub fn new(default_expiry: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            refresh_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            build_calls: AtomicUsize::new(0),
            refresh_results: Mutex::new(VecDeque::new()),
            probe_results: Mutex::new(VecDeque::new()),
            default_expiry: Mutex::new(default_expiry),
            refresh_delay: Mutex::new(None),
        })
    }

    pub fn push_refresh_failure(&self, error: ProviderError) {
        self.refresh_results.lock().unwrap().push_back(Err(error));
    }

    pub fn push_probe_failure(&self, error: ProviderError) {
        self.probe_results.lock().unwrap().push_back(Err(error));
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }
}

pub struct FakeProviderClient {
    state: Arc<FakeProviderState>,
}

#[async_trait]
impl ProviderClient for FakeProviderClient {
    async fn refresh_token(&self, _refresh_token: &str) -> Result<RefreshedToken, ProviderError> {
        let delay = *self.state.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let call = self.state.refresh_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(result) = self.state.refresh_results.lock().unwrap().pop_front() {
            return result;
        }
        let expires_at = *self.state.default_expiry.lock().unwrap();
        Ok(RefreshedToken {
            access_token: format!("fresh-at-{call}"),
            refresh_token: None,
            expires_at,
        })
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.state.probe_results.lock().unwrap().pop_front() {
            return result;
        }
        Ok(())
    }
}

pub struct FakeProviderFactory {
    pub state: Arc<FakeProviderState>,
}

#[async_trait]
impl ProviderClientFactory for FakeProviderFactory {
    async fn build(
        &self,
        _credential: &Credential,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.state.build_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeProviderClient {
            state: self.state.clone(),
        }))
    }
}

/// Sink that records every event it sees
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<HealthEvent>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, event: HealthEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    pub fn reconnection_events(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, HealthEvent::ReconnectionRequired { .. }))
            .count()
    }

    pub fn recovered_events(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, HealthEvent::Recovered { .. }))
            .count()
    }
}

/// Queue that records every task it is handed
#[derive(Default)]
pub struct RecordingQueue {
    pub tasks: Mutex<Vec<RetryTask>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, task: RetryTask) -> anyhow::Result<()> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub repository: Arc<MemoryHealthRepository>,
    pub provider: Arc<FakeProviderState>,
    pub sink: Arc<RecordingSink>,
    pub queue: Arc<RecordingQueue>,
}

pub fn harness(config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let credentials = Arc::new(MemoryCredentialStore::new());
    let repository = Arc::new(MemoryHealthRepository::new());
    let provider = FakeProviderState::new(t0() + hours(72));
    let sink = Arc::new(RecordingSink::default());
    let queue = Arc::new(RecordingQueue::default());

    let engine = Engine::new(
        Collaborators {
            repository: repository.clone(),
            credentials: credentials.clone(),
            factory: Arc::new(FakeProviderFactory {
                state: provider.clone(),
            }),
            sink: sink.clone(),
            queue: queue.clone(),
            clock: clock.clone(),
        },
        config,
    );

    Harness {
        engine: Arc::new(engine),
        clock,
        credentials,
        repository,
        provider,
        sink,
        queue,
    }
}
