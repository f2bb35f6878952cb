use super::handlers::{ErrorHandler, ThrottlingHandler, TransmissionHandler, TransmissionHandlerArgs};
use super::partial::PartialSuccessHandler;
use crate::config::BackoffConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Gating state consulted by every sender before a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionPolicy {
    Unblocked,
    Blocked { until: Instant },
}

/// Shared blocking state, one instance per channel, read by all senders.
///
/// An elapsed moratorium reads as unblocked; no timer task is needed.
#[derive(Debug)]
pub struct TransmissionPolicyState {
    inner: Mutex<PolicyInner>,
}

#[derive(Debug)]
struct PolicyInner {
    policy: TransmissionPolicy,
    consecutive_errors: u32,
}

impl TransmissionPolicyState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PolicyInner {
                policy: TransmissionPolicy::Unblocked,
                consecutive_errors: 0,
            }),
        }
    }

    pub fn current_policy(&self) -> TransmissionPolicy {
        let mut inner = self.inner.lock();
        if let TransmissionPolicy::Blocked { until } = inner.policy
            && until <= Instant::now()
        {
            inner.policy = TransmissionPolicy::Unblocked;
        }
        inner.policy
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.current_policy(), TransmissionPolicy::Blocked { .. })
    }

    /// Starts or extends the send moratorium. A shorter deadline never
    /// shortens an existing one.
    pub fn block_for(&self, delay: Duration) -> Instant {
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock();
        let effective = match inner.policy {
            TransmissionPolicy::Blocked { until } if until > deadline => until,
            _ => deadline,
        };
        inner.policy = TransmissionPolicy::Blocked { until: effective };
        effective
    }

    /// Records one failed send, returning the consecutive failure count.
    pub fn record_error(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.consecutive_errors = inner.consecutive_errors.saturating_add(1);
        inner.consecutive_errors
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.lock().consecutive_errors
    }

    /// Resets to unblocked and clears the failure streak.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.policy = TransmissionPolicy::Unblocked;
        inner.consecutive_errors = 0;
    }
}

impl Default for TransmissionPolicyState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff schedule used when the backend does not name a delay.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    config: BackoffConfig,
}

impl BackoffSchedule {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Delay for the given consecutive failure count (1-based).
    pub fn delay_for(&self, consecutive_errors: u32) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(16);
        let base_millis = self.config.initial_backoff().as_millis() as u64;
        let scaled = Duration::from_millis(base_millis.saturating_mul(1u64 << exponent));
        let capped = scaled.min(self.config.max_backoff());

        if self.config.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.5..1.5); // ±50% jitter
    let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
    Duration::from_millis(jittered_millis)
}

/// Parses a `Retry-After` header value: delta-seconds or an HTTP date.
/// Unparseable or already-elapsed values yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

/// Owns the blocking state machine, the instant-retry cap, and the ordered
/// handler chain invoked for non-success responses.
pub struct TransmissionPolicyManager {
    state: Arc<TransmissionPolicyState>,
    schedule: BackoffSchedule,
    max_instant_retries: u32,
    handlers: Vec<Box<dyn TransmissionHandler>>,
}

impl TransmissionPolicyManager {
    /// Creates a manager with no handlers registered.
    pub fn new(backoff: BackoffConfig, max_instant_retries: u32) -> Self {
        Self {
            state: Arc::new(TransmissionPolicyState::new()),
            schedule: BackoffSchedule::new(backoff),
            max_instant_retries,
            handlers: Vec::new(),
        }
    }

    /// Creates a manager with the standard chain: partial success, throttling,
    /// server error.
    pub fn with_default_handlers(backoff: BackoffConfig, max_instant_retries: u32) -> Self {
        let mut manager = Self::new(backoff, max_instant_retries);
        manager.register_handler(Box::new(PartialSuccessHandler::new()));
        manager.register_handler(Box::new(ThrottlingHandler::new(
            manager.state.clone(),
            manager.schedule.clone(),
        )));
        manager.register_handler(Box::new(ErrorHandler::new(
            manager.state.clone(),
            manager.schedule.clone(),
            max_instant_retries,
        )));
        manager
    }

    /// Handlers run in registration order; the first to accept a response wins.
    pub fn register_handler(&mut self, handler: Box<dyn TransmissionHandler>) {
        self.handlers.push(handler);
    }

    /// Fans a non-success response out to the handler chain.
    pub fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool {
        for handler in &self.handlers {
            if handler.on_transmission_sent(args) {
                debug!(
                    transmission = args.transmission.id(),
                    status = args.status,
                    "response accepted by transmission handler"
                );
                return true;
            }
        }
        trace!(status = args.status, "no transmission handler accepted response");
        false
    }

    /// Any successful send clears blocking; liveness is independent of the
    /// transmission that originally caused it.
    pub fn clear_backoff(&self) {
        self.state.clear();
    }

    pub fn state(&self) -> Arc<TransmissionPolicyState> {
        self.state.clone()
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    pub fn max_instant_retries(&self) -> u32 {
        self.max_instant_retries
    }
}
