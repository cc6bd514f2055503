//! Tether Core Resilience: pure-logic protection primitives
//!
//! # Overview
//!
//! Building blocks that shield an upstream provider API from an engine that
//! would otherwise hammer it:
//!
//! - **Window Limiter**: per-key rolling-window attempt counting with
//!   `retry_after` hints on denial
//! - **TTL Cache**: short-lived caching of expensive checks with asymmetric
//!   success/failure lifetimes
//! - **Client Pool**: bounded, LRU-evicting cache of constructed API clients
//!   keyed by credential fingerprint
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Providers, credentials, or OAuth semantics
//! - Storage or persistence
//! - Wall clocks — callers pass `now` into every time-sensitive operation,
//!   which keeps behavior deterministic under test
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Refresh Coordinator              │
//! └──────┬───────────┬───────────┬──────────┘
//!        │           │           │
//!        ▼           ▼           ▼
//! ┌────────────┐ ┌─────────┐ ┌────────────┐
//! │  TTL Cache │ │ Window  │ │   Client   │
//! │ (skip the  │ │ Limiter │ │    Pool    │
//! │  round     │ │ (gate   │ │ (reuse API │
//! │  trip)     │ │  calls) │ │  clients)  │
//! └────────────┘ └─────────┘ └─────┬──────┘
//!                                  │
//!                                  ▼
//!                          Provider API
//! ```

pub mod cache;
pub mod error;
pub mod pool;
pub mod rate_limit;

// Re-export main types for convenience
pub use cache::{CacheConfig, TtlCache};
pub use error::ResilienceError;
pub use pool::{ClientPool, PoolConfig, PoolStats};
pub use rate_limit::{Decision, RateLimitConfig, WindowLimiter, WindowSnapshot};

#[cfg(feature = "governor-impl")]
pub use rate_limit::governor_impl::GovernorLimiter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use tether_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::cache::{CacheConfig, TtlCache};
    pub use super::error::ResilienceError;
    pub use super::pool::{ClientPool, PoolConfig, PoolStats};
    pub use super::rate_limit::{Decision, RateLimitConfig, WindowLimiter, WindowSnapshot};
}
