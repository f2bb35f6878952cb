use super::transmission::Transmission;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Re-injects a transmission into the send pipeline.
///
/// `dispatch` must be non-blocking from the caller's perspective and must not
/// reset the transmission's accumulated send counter.
pub trait TransmissionDispatcher: Send + Sync {
    fn dispatch(&self, transmission: Transmission);
}

/// Queue-backed dispatcher. The channel worker drains re-queued transmissions
/// ahead of freshly batched ones.
#[derive(Clone)]
pub struct TransmissionQueue {
    tx: mpsc::UnboundedSender<Transmission>,
}

impl TransmissionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transmission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TransmissionDispatcher for TransmissionQueue {
    fn dispatch(&self, transmission: Transmission) {
        trace!(
            transmission = transmission.id(),
            sends = transmission.number_of_sends(),
            "re-queueing transmission"
        );
        if self.tx.send(transmission).is_err() {
            warn!("transmission queue closed, dropping re-queued transmission");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::transmission::CONTENT_TYPE_JSON_STREAM;

    #[tokio::test]
    async fn dispatch_preserves_send_counter() {
        let (queue, mut rx) = TransmissionQueue::new();
        let transmission = Transmission::new(&b"item"[..], CONTENT_TYPE_JSON_STREAM, "");
        transmission.increment_sends();
        transmission.increment_sends();

        queue.dispatch(transmission);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.number_of_sends(), 2);
    }

    #[tokio::test]
    async fn dispatch_after_receiver_drop_does_not_panic() {
        let (queue, rx) = TransmissionQueue::new();
        drop(rx);
        queue.dispatch(Transmission::new(&b"item"[..], CONTENT_TYPE_JSON_STREAM, ""));
    }
}
