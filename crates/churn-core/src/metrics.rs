use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide outcome counters shared by the foreground loop, the churn
/// task and the callback path. Increment-only.
#[derive(Debug, Default)]
pub struct Metrics {
    success: AtomicU64,
    failure: AtomicU64,
    disconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub success_count: u64,
    pub failure_count: u64,
    pub disconnect_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            success_count: self.success.load(Ordering::Relaxed),
            failure_count: self.failure.load(Ordering::Relaxed),
            disconnect_count: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    pub fn actions(&self) -> u64 {
        self.success_count + self.failure_count
    }
}
