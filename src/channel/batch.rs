use crate::config::BatchConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::warn;

/// Groups telemetry items into batches by size and age.
///
/// Producers never block: when the pending queue is full, the oldest items
/// are dropped to make room.
pub struct TelemetryBatcher {
    inner: Mutex<BatcherInner>,
    config: BatchConfig,
    notify: Arc<Notify>,
}

struct BatcherInner {
    pending: VecDeque<String>,
    first_pending_at: Option<Instant>,
    ready: VecDeque<Vec<String>>,
}

impl TelemetryBatcher {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            inner: Mutex::new(BatcherInner {
                pending: VecDeque::new(),
                first_pending_at: None,
                ready: VecDeque::new(),
            }),
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Queues one item; returns the number of items dropped to make room.
    pub fn push(&self, item: String) -> usize {
        let mut dropped = 0;
        {
            let mut inner = self.inner.lock();
            while inner.pending.len() >= self.config.max_pending_items {
                inner.pending.pop_front();
                dropped += 1;
            }

            if inner.pending.is_empty() {
                inner.first_pending_at = Some(Instant::now());
            }
            inner.pending.push_back(item);

            if inner.pending.len() >= self.config.max_batch_size {
                Self::roll_locked(&mut inner, self.config.max_batch_size);
                self.notify.notify_one();
            }
        }

        if dropped > 0 {
            warn!(dropped, "pending telemetry overflow, dropped oldest items");
        }
        dropped
    }

    /// Rolls a time-based batch when the oldest pending item has waited past
    /// the configured interval.
    pub fn roll_if_due(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let due = inner
            .first_pending_at
            .is_some_and(|first| now.duration_since(first) >= self.config.max_batch_interval());

        if due {
            Self::roll_locked(&mut inner, self.config.max_batch_size);
            self.notify.notify_one();
        }
        due
    }

    /// Moves everything pending into ready batches.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        while !inner.pending.is_empty() {
            Self::roll_locked(&mut inner, self.config.max_batch_size);
        }
        self.notify.notify_one();
    }

    pub fn pop_ready(&self) -> Option<Vec<String>> {
        self.inner.lock().ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.inner.lock().ready.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Resolves when a batch becomes ready.
    pub async fn ready_signal(&self) {
        self.notify.notified().await;
    }

    fn roll_locked(inner: &mut BatcherInner, take: usize) {
        let take = take.min(inner.pending.len());
        if take == 0 {
            return;
        }
        let batch: Vec<String> = inner.pending.drain(..take).collect();
        inner.first_pending_at = if inner.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        inner.ready.push_back(batch);
    }
}
