use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use telemetry_channel::channel::{
    GzipSerializer, Transmission, TransmissionHandler, TransmissionHandlerArgs,
    TransmissionPolicyManager, TransmissionQueue,
};
use telemetry_channel::config::BackoffConfig;
use tokio::sync::mpsc::UnboundedReceiver;

fn manager() -> TransmissionPolicyManager {
    TransmissionPolicyManager::with_default_handlers(
        BackoffConfig {
            initial_backoff_ms: 10,
            max_backoff_secs: 1,
            jitter: false,
        },
        3,
    )
}

fn args_for(
    status: u16,
    body: Option<&str>,
) -> (TransmissionHandlerArgs, UnboundedReceiver<Transmission>) {
    let items = vec![
        r#"{"name":"a"}"#.to_string(),
        r#"{"name":"b"}"#.to_string(),
    ];
    let (queue, resend_rx) = TransmissionQueue::new();
    let args = TransmissionHandlerArgs {
        transmission: GzipSerializer::new().serialize(&items).unwrap(),
        dispatcher: Some(Arc::new(queue)),
        response_body: body.map(str::to_owned),
        status,
        retry_after: None,
    };
    (args, resend_rx)
}

#[tokio::test]
async fn partial_success_wins_before_error_handlers() {
    let manager = manager();
    let body = r#"{"itemsReceived":2,"itemsAccepted":1,"errors":[
        {"index":0,"statusCode":500,"message":""}
    ]}"#;
    let (args, mut resend_rx) = args_for(206, Some(body));

    assert!(manager.on_transmission_sent(&args));

    // The partial-success handler re-queues the subset and does not throttle
    assert!(!manager.state().is_blocked());
    let requeued = resend_rx.try_recv().unwrap();
    let resent = GzipSerializer::new().reconstruct_items(&requeued).unwrap();
    assert_eq!(resent, vec![r#"{"name":"a"}"#.to_string()]);
}

#[tokio::test]
async fn throttling_handler_takes_429() {
    let manager = manager();
    let (args, mut resend_rx) = args_for(429, None);

    assert!(manager.on_transmission_sent(&args));
    assert!(manager.state().is_blocked());
    assert!(resend_rx.try_recv().is_ok());
}

#[tokio::test]
async fn unhandled_status_falls_through_the_chain() {
    let manager = manager();
    let (args, mut resend_rx) = args_for(403, None);

    assert!(!manager.on_transmission_sent(&args));
    assert!(!manager.state().is_blocked());
    assert!(resend_rx.try_recv().is_err());
}

struct CountingHandler {
    status: u16,
    hits: Arc<AtomicU32>,
}

impl TransmissionHandler for CountingHandler {
    fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool {
        if args.status != self.status {
            return false;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[tokio::test]
async fn custom_handlers_run_after_the_defaults() {
    let hits = Arc::new(AtomicU32::new(0));
    let mut manager = manager();
    manager.register_handler(Box::new(CountingHandler {
        status: 403,
        hits: hits.clone(),
    }));

    let (args, _resend_rx) = args_for(403, None);
    assert!(manager.on_transmission_sent(&args));
    assert_eq!(hits.load(Ordering::Relaxed), 1);

    // Statuses the defaults claim never reach the custom handler
    let (args, _resend_rx) = args_for(429, None);
    assert!(manager.on_transmission_sent(&args));
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}
