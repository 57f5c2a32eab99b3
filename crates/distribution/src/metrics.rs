//! Viewer metrics for observability

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for a single viewer
#[derive(Debug, Default)]
pub struct ViewerMetrics {
    /// Samples sent during replay
    replayed: AtomicU64,
    /// Samples sent after the end-of-replay marker
    live: AtomicU64,
    /// Failed sends (at most one per viewer; the worker ends on failure)
    send_failures: AtomicU64,
}

impl ViewerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replayed(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    pub fn inc_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    pub fn inc_live(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    pub fn inc_send_failures(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            replayed: self.replayed(),
            live: self.live(),
            send_failures: self.send_failures(),
        }
    }
}

/// Snapshot of viewer metrics (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub replayed: u64,
    pub live: u64,
    pub send_failures: u64,
}
