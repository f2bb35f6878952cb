pub mod batch;
pub mod dispatcher;
pub mod handlers;
pub mod output;
pub mod partial;
pub mod policy;
pub mod serialization;
pub mod stats;
pub mod transmission;

pub use batch::TelemetryBatcher;
pub use dispatcher::{TransmissionDispatcher, TransmissionQueue};
pub use handlers::{
    ErrorHandler, ThrottlingHandler, TransmissionHandler, TransmissionHandlerArgs, is_retryable,
};
pub use output::{NetworkOutput, OutputError, SendResult, TransmissionOutput};
pub use partial::{BackendError, BackendResponse, PartialSuccessHandler};
pub use policy::{
    BackoffSchedule, TransmissionPolicy, TransmissionPolicyManager, TransmissionPolicyState,
};
pub use serialization::{GzipSerializer, SerializationError};
pub use stats::{ChannelStats, ChannelStatsSnapshot};
pub use transmission::{CONTENT_ENCODING_GZIP, CONTENT_TYPE_JSON_STREAM, Transmission};

use crate::config::{ChannelConfig, ConfigError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Output error: {0}")]
    Output(#[from] OutputError),
    #[error("Stop timeout exceeded")]
    StopTimeout,
}

/// Front door of the transmission pipeline.
///
/// Producers hand pre-serialized telemetry items to [`track`]; a background
/// worker batches, compresses, and sends them, and replays whatever the
/// handler chain re-queues. Producers are never blocked and never see
/// transport failures.
///
/// [`track`]: TelemetryChannel::track
pub struct TelemetryChannel {
    batcher: Arc<TelemetryBatcher>,
    output: Arc<NetworkOutput>,
    policy: Arc<TransmissionPolicyManager>,
    stats: Arc<ChannelStats>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TelemetryChannel {
    /// Spawns the sender worker; must be called within a tokio runtime.
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        config.validate()?;

        let policy = Arc::new(TransmissionPolicyManager::with_default_handlers(
            config.backoff.clone(),
            config.max_instant_retries,
        ));

        let (queue, resend_rx) = TransmissionQueue::new();
        let dispatcher: Arc<dyn TransmissionDispatcher> = Arc::new(queue);

        let mut output = NetworkOutput::new(&config, policy.clone())?;
        output.set_transmission_dispatcher(dispatcher);
        let output = Arc::new(output);
        let stats = output.stats();

        let batcher = Arc::new(TelemetryBatcher::new(config.batch.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(run_worker(SenderWorker {
            batcher: batcher.clone(),
            output: output.clone(),
            policy: policy.clone(),
            stats: stats.clone(),
            serializer: GzipSerializer::new(),
            resend_rx,
            shutdown_rx,
        }));

        info!(endpoint = output.endpoint(), "telemetry channel started");

        Ok(Self {
            batcher,
            output,
            policy,
            stats,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Queues one pre-serialized telemetry item. Never blocks.
    pub fn track(&self, item: impl Into<String>) {
        if self.stopped.load(Ordering::SeqCst) {
            trace!("channel stopped, dropping telemetry item");
            self.stats.record_items_dropped(1);
            return;
        }

        let dropped = self.batcher.push(item.into());
        if dropped > 0 {
            self.stats.record_items_dropped(dropped as u64);
        }
    }

    /// Moves everything pending toward the sender immediately.
    pub fn flush(&self) {
        self.batcher.flush();
    }

    /// Stops the channel: refuses future items, flushes what is pending, and
    /// waits up to `timeout` for the worker to drain. Idempotent; in-flight
    /// requests are not aborted.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ChannelError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.batcher.flush();
        let _ = self.shutdown_tx.send(true);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("channel worker did not drain within {timeout:?}");
                self.output.stop();
                return Err(ChannelError::StopTimeout);
            }
        }

        self.output.stop();
        debug!("telemetry channel stopped");
        Ok(())
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn policy_state(&self) -> Arc<TransmissionPolicyState> {
        self.policy.state()
    }
}

struct SenderWorker {
    batcher: Arc<TelemetryBatcher>,
    output: Arc<NetworkOutput>,
    policy: Arc<TransmissionPolicyManager>,
    stats: Arc<ChannelStats>,
    serializer: GzipSerializer,
    resend_rx: mpsc::UnboundedReceiver<Transmission>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_worker(worker: SenderWorker) {
    let SenderWorker {
        batcher,
        output,
        policy,
        stats,
        serializer,
        mut resend_rx,
        mut shutdown_rx,
    } = worker;

    // Gate clone used to stay responsive to shutdown while sleeping out a
    // send moratorium.
    let mut gate_rx = shutdown_rx.clone();
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            // Re-sends drain ahead of fresh batches.
            biased;
            _ = shutdown_rx.changed() => break,
            maybe = resend_rx.recv() => {
                if let Some(transmission) = maybe {
                    stats.record_requeued();
                    send_when_unblocked(&output, &policy, &mut gate_rx, &transmission).await;
                }
            }
            _ = batcher.ready_signal() => {
                send_ready_batches(&batcher, &serializer, &output, &policy, &mut gate_rx).await;
            }
            _ = tick.tick() => {
                batcher.roll_if_due(Instant::now());
                send_ready_batches(&batcher, &serializer, &output, &policy, &mut gate_rx).await;
            }
        }
    }

    drain_remaining(batcher, serializer, output, resend_rx).await;
}

/// Sleeps out an active moratorium (staying responsive to shutdown), then
/// sends. The output re-checks the policy itself; this only avoids pointless
/// fail-overs while blocked.
async fn send_when_unblocked(
    output: &NetworkOutput,
    policy: &TransmissionPolicyManager,
    gate_rx: &mut watch::Receiver<bool>,
    transmission: &Transmission,
) {
    loop {
        match policy.state().current_policy() {
            TransmissionPolicy::Unblocked => break,
            TransmissionPolicy::Blocked { until } => {
                let wait = until.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = gate_rx.changed() => break,
                }
            }
        }
    }

    if let SendResult::RetryElsewhere = output.send(transmission).await {
        warn!(
            transmission = transmission.id(),
            "no secondary output configured, transmission dropped"
        );
    }
}

async fn send_ready_batches(
    batcher: &TelemetryBatcher,
    serializer: &GzipSerializer,
    output: &NetworkOutput,
    policy: &TransmissionPolicyManager,
    gate_rx: &mut watch::Receiver<bool>,
) {
    while let Some(items) = batcher.pop_ready() {
        match serializer.serialize(&items) {
            Ok(transmission) => {
                send_when_unblocked(output, policy, gate_rx, &transmission).await;
            }
            Err(e) => warn!("failed to serialize telemetry batch: {e}"),
        }
    }
}

/// One bounded pass over everything still queued at shutdown. Transmissions
/// re-queued by handlers during this pass are dropped.
async fn drain_remaining(
    batcher: Arc<TelemetryBatcher>,
    serializer: GzipSerializer,
    output: Arc<NetworkOutput>,
    mut resend_rx: mpsc::UnboundedReceiver<Transmission>,
) {
    batcher.flush();
    while let Some(items) = batcher.pop_ready() {
        match serializer.serialize(&items) {
            Ok(transmission) => {
                let _ = output.send(&transmission).await;
            }
            Err(e) => warn!("failed to serialize telemetry batch: {e}"),
        }
    }

    let mut leftovers = Vec::new();
    while let Ok(transmission) = resend_rx.try_recv() {
        leftovers.push(transmission);
    }
    for transmission in leftovers {
        let _ = output.send(&transmission).await;
    }
}
