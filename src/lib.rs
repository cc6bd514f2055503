//! # Tether
//!
//! Connection health and token refresh engine for cloud-storage provider
//! integrations. Tether sits between a file-intake application and the
//! provider APIs it relays uploads into, and answers one question well:
//! *is this user's provider connection usable, and if not, what now?*
//!
//! ## What it does
//!
//! - Tracks live health/authentication state per (user, provider) pair in a
//!   five-state machine with enforced invariants
//! - Refreshes OAuth-style access tokens safely under concurrency, with
//!   optimistic race detection so parallel callers never double-refresh
//! - Classifies provider errors into a closed taxonomy with deterministic,
//!   most-specific-first precedence
//! - Drives retry/backoff/escalate policy, converting exhausted retries
//!   into explicit "reconnect your account" state
//! - Protects the provider API with per-pair rate limiting, asymmetric-TTL
//!   response caching, and a bounded client pool
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Engine (facade)               │
//! └──────┬────────────────┬───────────────┬───────┘
//!        │                │               │
//!        ▼                ▼               ▼
//! ┌────────────┐  ┌───────────────┐  ┌──────────┐
//! │  Refresh   │  │ HealthStatus  │  │ Recovery │
//! │Coordinator │─►│    Store      │◄─│  Engine  │
//! └──┬───┬───┬─┘  └───────┬───────┘  └─────┬────┘
//!    │   │   │            │                │
//!    ▼   ▼   ▼            ▼                ▼
//!  cache limiter pool  repository      task queue
//!                      credentials     notifications
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::{Collaborators, Engine, EngineConfig, Provider};
//! use tether_core_health::MemoryCredentialStore;
//! # use tether::provider::{ProviderClient, ProviderClientFactory, ProviderError};
//! # use tether_core_health::Credential;
//! # struct DriveFactory;
//! # #[async_trait::async_trait]
//! # impl ProviderClientFactory for DriveFactory {
//! #     async fn build(&self, _c: &Credential) -> Result<Arc<dyn ProviderClient>, ProviderError> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), tether::EngineError> {
//! let credentials = Arc::new(MemoryCredentialStore::new());
//! let factory = Arc::new(DriveFactory);
//!
//! let engine = Engine::new(
//!     Collaborators::with_defaults(credentials, factory),
//!     EngineConfig::default(),
//! );
//!
//! match engine.ensure_valid_token("user-42", Provider::GoogleDrive).await {
//!     Ok(outcome) => println!("token expires at {}", outcome.token().expires_at),
//!     Err(err) => println!("connection problem: {}", err),
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod provider;
pub mod recovery;
pub mod refresh;

// Re-export the engine surface
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{Collaborators, Engine};
pub use error::EngineError;
pub use recovery::{FailureContext, RecoveryEngine, RecoveryOutcome, RetryTask, TaskQueue};
pub use refresh::{
    BatchReport, Operation, PlannedAction, RateLimitReport, RefreshOutcome, Token,
    TokenRefreshCoordinator,
};

// Re-export the taxonomy and health types callers interact with
pub use tether_core_classify::{classify, ErrorKind, KindMetadata};
pub use tether_core_health::{
    ConnectionStatus, ConsolidatedStatus, Credential, CredentialStore, HealthEvent,
    HealthRepository, HealthStatus, HealthStatusStore, NotificationSink, Provider,
};
