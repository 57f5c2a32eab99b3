//! Reconnection policy, reading-channel backpressure and handle metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use contracts::ReconnectConfig;

/// Retry policy applied after an unexpected drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before the handle is marked `Failed`
    pub max_attempts: u32,

    /// Wait before each attempt
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_secs_f64(config.backoff_secs),
        }
    }
}

/// What to do when a handle's reading channel is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Evict the oldest queued reading to make room
    #[default]
    DropOldest,
    /// Discard the incoming reading
    DropNewest,
}

/// Per-handle reading channel configuration
#[derive(Debug, Clone)]
pub struct ReadingChannelConfig {
    pub capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for ReadingChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

/// Connection manager counters, shared by all handle tasks
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    pub readings_received: AtomicU64,
    pub readings_dropped: AtomicU64,
    pub connects: AtomicU64,
    pub drops: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub failures: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.readings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.readings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            readings_received: self.readings_received.load(Ordering::Relaxed),
            readings_dropped: self.readings_dropped.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub readings_received: u64,
    pub readings_dropped: u64,
    /// Successful connects, initial and reconnect
    pub connects: u64,
    /// Unexpected link losses
    pub drops: u64,
    pub reconnect_attempts: u64,
    /// Handles that ended in `Failed`
    pub failures: u64,
}
