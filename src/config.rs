/*!
 * Configuration types for the Tether engine
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core_health::store::StoreConfig;
use tether_core_resilience::{CacheConfig, PoolConfig, RateLimitConfig};

/// Main configuration for the engine
///
/// Every numeric policy knob lives here rather than in code; the historical
/// implementation scattered divergent constants across commands, and this
/// struct is the single replacement for all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-operation attempt caps
    #[serde(default)]
    pub rate_limits: RateLimitSettings,

    /// Check-result cache TTLs
    #[serde(default)]
    pub cache: CacheSettings,

    /// Client pool sizing and staleness
    #[serde(default)]
    pub pool: PoolSettings,

    /// Token refresh behavior
    #[serde(default)]
    pub refresh: RefreshSettings,

    /// Batch refresh behavior
    #[serde(default)]
    pub batch: BatchSettings,

    /// Health state-machine thresholds and recovery ceilings
    #[serde(default)]
    pub health: HealthSettings,

    /// Diagnostic logging
    #[serde(default)]
    pub log: LogSettings,
}

/// Attempt caps per operation within a rolling window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Token refresh attempts per window per (user, provider)
    #[serde(default = "default_token_refresh_cap")]
    pub token_refresh_per_window: u32,

    /// Connectivity test attempts per window per (user, provider)
    #[serde(default = "default_connectivity_cap")]
    pub connectivity_test_per_window: u32,

    /// Rolling window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            token_refresh_per_window: default_token_refresh_cap(),
            connectivity_test_per_window: default_connectivity_cap(),
            window_secs: default_window_secs(),
        }
    }
}

/// TTL pair for cached check results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of cached successful checks, in seconds
    #[serde(default = "default_success_ttl_secs")]
    pub success_ttl_secs: u64,

    /// Lifetime of cached failed checks, in seconds. Kept shorter: failures
    /// are more likely transient and worth re-checking sooner.
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            success_ttl_secs: default_success_ttl_secs(),
            failure_ttl_secs: default_failure_ttl_secs(),
        }
    }
}

/// Client pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum cached provider clients
    #[serde(default = "default_pool_size")]
    pub max_size: usize,

    /// Idle time before `optimize` evicts an entry, in seconds
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

/// Token refresh behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSettings {
    /// Proactive-refresh lookahead in hours: tokens expiring beyond this are
    /// left alone so proactive refresh never thrashes healthy tokens
    #[serde(default = "default_lookahead_hours")]
    pub lookahead_hours: u64,

    /// Deadline for each provider call, in seconds
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            lookahead_hours: default_lookahead_hours(),
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// Batch refresh behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Chunk size for batch processing; also bounds parallelism together
    /// with the pool size
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Candidate window in hours: credentials expiring within it (or already
    /// expired) are selected
    #[serde(default = "default_batch_window_hours")]
    pub window_hours: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            window_hours: default_batch_window_hours(),
        }
    }
}

/// Health thresholds and recovery ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Consecutive transient failures before Degraded escalates to Unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Automatic retries before a retryable failure is escalated to
    /// requires-reconnection
    #[serde(default = "default_max_auto_retries")]
    pub max_auto_retries: u32,

    /// Base delay for exponential backoff, in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Cap on exponential backoff, in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            unhealthy_threshold: default_unhealthy_threshold(),
            max_auto_retries: default_max_auto_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Diagnostic logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Conservative profile: tight caps and a small pool, for deployments
    /// sharing a provider project with other consumers of its quota.
    pub fn conservative() -> Self {
        Self {
            rate_limits: RateLimitSettings {
                token_refresh_per_window: 5,
                connectivity_test_per_window: 10,
                window_secs: 3600,
            },
            pool: PoolSettings {
                max_size: 4,
                idle_eviction_secs: 900,
            },
            batch: BatchSettings {
                size: 5,
                window_hours: 6,
            },
            ..Default::default()
        }
    }

    /// Aggressive profile: wide caps and a large pool, for dedicated
    /// provider projects with headroom.
    pub fn aggressive() -> Self {
        Self {
            rate_limits: RateLimitSettings {
                token_refresh_per_window: 30,
                connectivity_test_per_window: 60,
                window_secs: 3600,
            },
            pool: PoolSettings {
                max_size: 50,
                idle_eviction_secs: 3600,
            },
            batch: BatchSettings {
                size: 20,
                window_hours: 12,
            },
            ..Default::default()
        }
    }

    /// Limiter configuration for token refreshes
    pub fn refresh_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_attempts: self.rate_limits.token_refresh_per_window,
            window: Duration::from_secs(self.rate_limits.window_secs),
        }
    }

    /// Limiter configuration for connectivity tests
    pub fn probe_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_attempts: self.rate_limits.connectivity_test_per_window,
            window: Duration::from_secs(self.rate_limits.window_secs),
        }
    }

    /// Check-cache configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl_success: Duration::from_secs(self.cache.success_ttl_secs),
            ttl_failure: Duration::from_secs(self.cache.failure_ttl_secs),
        }
    }

    /// Client pool configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool.max_size,
            idle_eviction: Duration::from_secs(self.pool.idle_eviction_secs),
        }
    }

    /// Health store configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            unhealthy_threshold: self.health.unhealthy_threshold,
            expiry_lookahead: self.lookahead(),
            ..Default::default()
        }
    }

    /// Proactive-refresh lookahead as a duration
    pub fn lookahead(&self) -> Duration {
        Duration::from_secs(self.refresh.lookahead_hours * 3600)
    }

    /// Provider call deadline
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh.provider_timeout_secs)
    }
}

fn default_token_refresh_cap() -> u32 {
    10
}
fn default_connectivity_cap() -> u32 {
    20
}
fn default_window_secs() -> u64 {
    3600
}
fn default_success_ttl_secs() -> u64 {
    300
}
fn default_failure_ttl_secs() -> u64 {
    20
}
fn default_pool_size() -> usize {
    10
}
fn default_idle_eviction_secs() -> u64 {
    1800
}
fn default_lookahead_hours() -> u64 {
    24
}
fn default_provider_timeout_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_window_hours() -> u64 {
    6
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_max_auto_retries() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    5
}
fn default_backoff_cap_secs() -> u64 {
    900
}
