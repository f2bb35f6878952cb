use super::dispatcher::TransmissionDispatcher;
use super::handlers::{NETWORK_FAILURE, TransmissionHandlerArgs};
use super::partial::PARTIAL_CONTENT;
use super::policy::TransmissionPolicyManager;
use super::stats::ChannelStats;
use super::transmission::Transmission;
use crate::config::ChannelConfig;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use url::Url;

const OK: u16 = 200;
const BAD_REQUEST: u16 = 400;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Outcome of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The backend acknowledged the transmission.
    Delivered,
    /// This output is done with the transmission: rejected permanently or
    /// handed to the handler chain, which decides any further resend.
    Dropped,
    /// This output refused the attempt (stopped, blocked, or past the
    /// instant-retry cap); a secondary output may take the transmission over.
    RetryElsewhere,
}

/// Sink for transmissions; implemented by the network output and by any
/// secondary output a host wires behind it (disk spooling, for example).
pub trait TransmissionOutput: Send + Sync {
    fn send(
        &self,
        transmission: &Transmission,
    ) -> impl std::future::Future<Output = SendResult> + Send;
    fn stop(&self);
}

/// Performs one best-effort HTTP POST per `send` call.
///
/// Failures never escape this boundary: they become a [`SendResult`] and,
/// for non-success statuses, a pass through the handler chain.
pub struct NetworkOutput {
    client: reqwest::Client,
    endpoint: Url,
    policy: Arc<TransmissionPolicyManager>,
    dispatcher: Option<Arc<dyn TransmissionDispatcher>>,
    stats: Arc<ChannelStats>,
    stopped: AtomicBool,
}

impl NetworkOutput {
    pub fn new(
        config: &ChannelConfig,
        policy: Arc<TransmissionPolicyManager>,
    ) -> Result<Self, OutputError> {
        let endpoint: Url = config.endpoint.parse().map_err(|e| {
            OutputError::InvalidConfiguration(format!("Invalid endpoint URL: {e}"))
        })?;

        // Connect and request timeouts are mandatory so no sender thread
        // hangs on a dead backend.
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                OutputError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint,
            policy,
            dispatcher: None,
            stats: Arc::new(ChannelStats::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Injects the dispatcher the handler chain uses for resubmissions.
    pub fn set_transmission_dispatcher(&mut self, dispatcher: Arc<dyn TransmissionDispatcher>) {
        self.dispatcher = Some(dispatcher);
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub fn stats(&self) -> Arc<ChannelStats> {
        self.stats.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn post_transmission(
        &self,
        transmission: &Transmission,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, transmission.content_type())
            .body(transmission.content().clone());

        if !transmission.content_encoding().is_empty() {
            request = request.header(CONTENT_ENCODING, transmission.content_encoding());
        }

        request.send().await
    }
}

impl TransmissionOutput for NetworkOutput {
    async fn send(&self, transmission: &Transmission) -> SendResult {
        if self.stopped.load(Ordering::SeqCst) {
            trace!(
                transmission = transmission.id(),
                "output stopped, refusing send"
            );
            self.stats.record_failed_over();
            return SendResult::RetryElsewhere;
        }

        // Cooperative backpressure: a blocked policy fails the attempt over
        // without network I/O.
        if self.policy.state().is_blocked() {
            trace!(
                transmission = transmission.id(),
                "sends blocked by policy, refusing send"
            );
            self.stats.record_failed_over();
            return SendResult::RetryElsewhere;
        }

        let attempt = transmission.increment_sends();
        let start = Instant::now();

        let (status, response_body, retry_after) = match self.post_transmission(transmission).await
        {
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                let body = response.text().await.ok();
                (status, body, retry_after)
            }
            Err(e) => {
                error!(
                    transmission = transmission.id(),
                    "failed to send transmission: {e}"
                );
                (NETWORK_FAILURE, None, None)
            }
        };
        self.stats.record_attempt(start.elapsed());

        // Past the instant-retry budget this output gives up so a secondary
        // output can take over.
        if status > PARTIAL_CONTENT && attempt > self.policy.max_instant_retries() {
            warn!(
                transmission = transmission.id(),
                status,
                sends = attempt,
                "instant retry limit reached, failing over"
            );
            self.stats.record_failed_over();
            return SendResult::RetryElsewhere;
        }

        if status == OK {
            // Any successful send proves the backend is reachable again.
            self.policy.clear_backoff();
            self.stats.record_delivered();
            debug!(
                transmission = transmission.id(),
                attempt,
                bytes = transmission.len(),
                "transmission delivered"
            );
            return SendResult::Delivered;
        }

        if status == BAD_REQUEST {
            error!(
                transmission = transmission.id(),
                "backend rejected transmission as malformed, dropping"
            );
            self.stats.record_dropped();
            return SendResult::Dropped;
        }

        let args = TransmissionHandlerArgs {
            transmission: transmission.clone(),
            dispatcher: self.dispatcher.clone(),
            response_body,
            status,
            retry_after,
        };
        if !self.policy.on_transmission_sent(&args) {
            // 401/403 and friends: unrecoverable here, handled elsewhere.
            trace!(
                transmission = transmission.id(),
                status,
                "response not retried by any handler"
            );
        }
        self.stats.record_dropped();
        SendResult::Dropped
    }

    /// Advisory and idempotent: future sends are refused, in-flight requests
    /// are not aborted.
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("network output stopped");
        }
    }
}
