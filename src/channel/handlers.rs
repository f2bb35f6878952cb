use super::dispatcher::TransmissionDispatcher;
use super::policy::{BackoffSchedule, TransmissionPolicyState, parse_retry_after};
use super::transmission::Transmission;
use std::sync::Arc;
use tracing::{trace, warn};

/// Synthetic status recorded when the POST failed before any HTTP response.
pub const NETWORK_FAILURE: u16 = 0;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const THROTTLED: u16 = 429;
/// Backend-specific "throttled over extended time" status.
pub const THROTTLED_OVER_EXTENDED_TIME: u16 = 439;
pub const INTERNAL_SERVER_ERROR: u16 = 500;
pub const SERVICE_UNAVAILABLE: u16 = 503;

/// Statuses for which the affected items are worth re-sending.
pub fn is_retryable(status: u16) -> bool {
    matches!(
        status,
        REQUEST_TIMEOUT
            | THROTTLED
            | THROTTLED_OVER_EXTENDED_TIME
            | INTERNAL_SERVER_ERROR
            | SERVICE_UNAVAILABLE
    )
}

/// Correlates one non-success send attempt for the handler chain.
///
/// Created per failed send, consumed synchronously by the chain, then
/// discarded. The transmission and dispatcher handles are cheap clones.
pub struct TransmissionHandlerArgs {
    pub transmission: Transmission,
    pub dispatcher: Option<Arc<dyn TransmissionDispatcher>>,
    pub response_body: Option<String>,
    pub status: u16,
    pub retry_after: Option<String>,
}

/// A responder in the non-success handler chain.
///
/// Returning `true` means the response was handled, possibly with a
/// resubmission, and stops the chain.
pub trait TransmissionHandler: Send + Sync {
    fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool;
}

/// Reacts to 429/439 by pausing sends for the backend-supplied duration and
/// re-queueing the throttled transmission.
pub struct ThrottlingHandler {
    state: Arc<TransmissionPolicyState>,
    schedule: BackoffSchedule,
}

impl ThrottlingHandler {
    pub fn new(state: Arc<TransmissionPolicyState>, schedule: BackoffSchedule) -> Self {
        Self { state, schedule }
    }
}

impl TransmissionHandler for ThrottlingHandler {
    fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool {
        if !matches!(args.status, THROTTLED | THROTTLED_OVER_EXTENDED_TIME) {
            return false;
        }

        let errors = self.state.record_error();
        let delay = args
            .retry_after
            .as_deref()
            .and_then(parse_retry_after)
            .unwrap_or_else(|| self.schedule.delay_for(errors));
        self.state.block_for(delay);

        warn!(
            transmission = args.transmission.id(),
            status = args.status,
            delay_ms = delay.as_millis() as u64,
            "backend throttled, pausing sends"
        );

        if let Some(dispatcher) = &args.dispatcher {
            dispatcher.dispatch(args.transmission.clone());
        }
        true
    }
}

/// Reacts to server-side failures (408/500/503) and transport-level failures
/// (synthetic status 0): engage backoff, re-queue while the instant-retry
/// budget lasts.
pub struct ErrorHandler {
    state: Arc<TransmissionPolicyState>,
    schedule: BackoffSchedule,
    max_instant_retries: u32,
}

impl ErrorHandler {
    pub fn new(
        state: Arc<TransmissionPolicyState>,
        schedule: BackoffSchedule,
        max_instant_retries: u32,
    ) -> Self {
        Self {
            state,
            schedule,
            max_instant_retries,
        }
    }
}

impl TransmissionHandler for ErrorHandler {
    fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool {
        if !matches!(
            args.status,
            NETWORK_FAILURE | REQUEST_TIMEOUT | INTERNAL_SERVER_ERROR | SERVICE_UNAVAILABLE
        ) {
            return false;
        }

        let errors = self.state.record_error();
        let delay = self.schedule.delay_for(errors);
        self.state.block_for(delay);

        if args.transmission.number_of_sends() > self.max_instant_retries {
            warn!(
                transmission = args.transmission.id(),
                status = args.status,
                sends = args.transmission.number_of_sends(),
                "instant retry budget exhausted, dropping transmission"
            );
            return true;
        }

        match &args.dispatcher {
            Some(dispatcher) => {
                trace!(
                    transmission = args.transmission.id(),
                    status = args.status,
                    delay_ms = delay.as_millis() as u64,
                    "re-queueing transmission after server error"
                );
                dispatcher.dispatch(args.transmission.clone());
            }
            None => {
                trace!(
                    transmission = args.transmission.id(),
                    "no dispatcher configured, transmission dropped"
                );
            }
        }
        true
    }
}
