use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters recording pipeline outcomes. Telemetry delivery is
/// best-effort, so drops are accounted for rather than surfaced as errors.
#[derive(Debug, Default)]
pub struct ChannelStats {
    attempts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_over: AtomicU64,
    requeued: AtomicU64,
    items_dropped: AtomicU64,
    total_response_time_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatsSnapshot {
    pub attempts: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Sends refused locally (stopped, blocked, or retry budget exhausted)
    /// that a secondary output could have taken over.
    pub failed_over: u64,
    pub requeued: u64,
    pub items_dropped: u64,
    pub average_response_time: Duration,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, response_time: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_over(&self) {
        self.failed_over.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_dropped(&self, count: u64) {
        self.items_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let total_response_time_ms = self.total_response_time_ms.load(Ordering::Relaxed);

        let average_response_time = if attempts > 0 {
            Duration::from_millis(total_response_time_ms / attempts)
        } else {
            Duration::ZERO
        };

        ChannelStatsSnapshot {
            attempts,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_over: self.failed_over.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            average_response_time,
        }
    }
}
