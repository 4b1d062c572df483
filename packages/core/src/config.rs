//! Engine Configuration
//!
//! Plain configuration structs with defaults. All of them deserialize, so a host
//! can embed them in its own config file; `EngineConfig::from_env` applies
//! `MEMGRAPH_SYNC_*` overrides on top of the defaults.
//!
//! | Variable                             | Field                          |
//! |--------------------------------------|--------------------------------|
//! | `MEMGRAPH_SYNC_BATCH_SIZE`           | `worker.batch_size`            |
//! | `MEMGRAPH_SYNC_CONCURRENCY`          | `worker.concurrency`           |
//! | `MEMGRAPH_SYNC_MAX_ATTEMPTS`         | `worker.max_attempts`          |
//! | `MEMGRAPH_SYNC_POLL_INTERVAL_MS`     | `worker.subscription` (poll)   |
//! | `MEMGRAPH_SYNC_CALL_TIMEOUT_MS`      | `call_timeout_ms`              |
//! | `MEMGRAPH_SYNC_MAX_DEPTH`            | `orphan.max_depth`             |

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default hop bound for orphan detection traversals
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// How the worker learns about new queue items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SubscriptionMode {
    /// Wake on queue events, with a slow safety poll
    Push,
    /// Ignore queue events and check the queue at a fixed interval
    Poll { interval_ms: u64 },
}

/// Configuration for the sync worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Items claimed per pass (default: 32)
    pub batch_size: usize,
    /// Items processed in parallel within a pass (default: 4)
    pub concurrency: usize,
    pub subscription: SubscriptionMode,
    /// Fallback poll in push mode, covers lagged event receivers (default: 5s)
    pub safety_poll_interval_ms: u64,
    /// Total attempts before an item fails terminally (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per failed attempt (default: 200ms)
    pub backoff_base_ms: u64,
    /// Upper bound on the retry delay (default: 30s)
    pub backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            concurrency: 4,
            subscription: SubscriptionMode::Push,
            safety_poll_interval_ms: 5_000,
            max_attempts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 30_000,
        }
    }
}

impl WorkerConfig {
    /// Retry delay after `failed_attempts` earlier failures
    ///
    /// `min(base * 2^failed_attempts, max)`
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let factor = 1u64.checked_shl(failed_attempts).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    /// Interval of the periodic queue check
    pub fn poll_interval(&self) -> Duration {
        match self.subscription {
            SubscriptionMode::Push => Duration::from_millis(self.safety_poll_interval_ms),
            SubscriptionMode::Poll { interval_ms } => Duration::from_millis(interval_ms),
        }
    }
}

/// Configuration for orphan detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanDetectorConfig {
    /// Hop bound for both the candidate walk and anchor searches (default: 10)
    pub max_depth: usize,
}

impl Default for OrphanDetectorConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub orphan: OrphanDetectorConfig,
    /// Deadline for each Graph Store Port call (default: 10s)
    pub call_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            orphan: OrphanDetectorConfig::default(),
            call_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Defaults with `MEMGRAPH_SYNC_*` environment overrides applied
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides read through `lookup`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring invalid value '{}' for {}", raw, name);
                    None
                }
            }
        }

        let mut config = Self::default();
        if let Some(v) = parsed(&lookup, "MEMGRAPH_SYNC_BATCH_SIZE") {
            config.worker.batch_size = v;
        }
        if let Some(v) = parsed(&lookup, "MEMGRAPH_SYNC_CONCURRENCY") {
            config.worker.concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "MEMGRAPH_SYNC_MAX_ATTEMPTS") {
            config.worker.max_attempts = v;
        }
        if let Some(interval_ms) = parsed(&lookup, "MEMGRAPH_SYNC_POLL_INTERVAL_MS") {
            config.worker.subscription = SubscriptionMode::Poll { interval_ms };
        }
        if let Some(v) = parsed(&lookup, "MEMGRAPH_SYNC_CALL_TIMEOUT_MS") {
            config.call_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "MEMGRAPH_SYNC_MAX_DEPTH") {
            config.orphan.max_depth = v;
        }
        config
    }
}
