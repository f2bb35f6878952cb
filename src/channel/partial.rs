use super::handlers::{TransmissionHandler, TransmissionHandlerArgs, is_retryable};
use super::serialization::GzipSerializer;
use serde::Deserialize;
use tracing::{error, trace};

pub const PARTIAL_CONTENT: u16 = 206;

/// Wire shape of a 206 partial-success response body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub items_received: usize,
    pub items_accepted: usize,
    #[serde(default)]
    pub errors: Vec<BackendError>,
}

/// One rejected item. `index` is the zero-based line position of the item in
/// the original request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendError {
    pub index: i64,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

/// Recovers resend-eligible items from a 206 response without re-sending the
/// items the backend already accepted.
pub struct PartialSuccessHandler {
    serializer: GzipSerializer,
}

impl PartialSuccessHandler {
    pub fn new() -> Self {
        Self {
            serializer: GzipSerializer::new(),
        }
    }

    fn parse_backend_response(body: &str) -> Option<BackendResponse> {
        match serde_json::from_str(body) {
            Ok(response) => Some(response),
            Err(e) => {
                trace!("failed to deserialize partial-success response: {e}");
                None
            }
        }
    }
}

impl Default for PartialSuccessHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmissionHandler for PartialSuccessHandler {
    fn on_transmission_sent(&self, args: &TransmissionHandlerArgs) -> bool {
        if args.status != PARTIAL_CONTENT {
            trace!(
                status = args.status,
                "status not handled by partial-success handler"
            );
            return false;
        }
        let Some(dispatcher) = &args.dispatcher else {
            return false;
        };

        let Some(response) = args
            .response_body
            .as_deref()
            .and_then(Self::parse_backend_response)
        else {
            // Cannot determine the partial outcome; the conservative default
            // is to resend nothing.
            return false;
        };

        let original_items = match self.serializer.reconstruct_items(&args.transmission) {
            Ok(items) => items,
            Err(e) => {
                error!(
                    transmission = args.transmission.id(),
                    "failed to reconstruct original items: {e}"
                );
                return false;
            }
        };

        // The backend's error indices refer to our request lines; if the
        // counts disagree the numbering cannot be trusted.
        if original_items.len() != response.items_received {
            trace!(
                sent = original_items.len(),
                received = response.items_received,
                "item count mismatch, skipping partial-success retry"
            );
            return false;
        }

        if response.items_accepted >= response.items_received {
            trace!("all items accepted, nothing to resend");
            return false;
        }

        let mut retry_indices = Vec::new();
        for backend_error in &response.errors {
            if !is_retryable(backend_error.status_code) {
                trace!(
                    index = backend_error.index,
                    status = backend_error.status_code,
                    reason = %backend_error.message,
                    "item rejected permanently"
                );
                continue;
            }
            // The backend can report an index outside the request; skip it.
            let Ok(index) = usize::try_from(backend_error.index) else {
                continue;
            };
            if index < original_items.len() {
                retry_indices.push(index);
            }
        }

        if retry_indices.is_empty() {
            return false;
        }

        // Resend in original request order regardless of how the backend
        // ordered its error list.
        retry_indices.sort_unstable();
        retry_indices.dedup();
        let retry_items: Vec<String> = retry_indices
            .iter()
            .map(|&index| original_items[index].clone())
            .collect();

        match self.serializer.serialize(&retry_items) {
            Ok(retry_transmission) => {
                retry_transmission.set_sends(args.transmission.number_of_sends());
                trace!(
                    transmission = args.transmission.id(),
                    retry = retry_transmission.id(),
                    items = retry_items.len(),
                    "re-queueing rejected items from partial success"
                );
                dispatcher.dispatch(retry_transmission);
                true
            }
            Err(e) => {
                error!("failed to serialize partial-success retry batch: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::dispatcher::TransmissionDispatcher;
    use crate::channel::transmission::Transmission;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<Transmission>>,
    }

    impl TransmissionDispatcher for RecordingDispatcher {
        fn dispatch(&self, transmission: Transmission) {
            self.dispatched.lock().push(transmission);
        }
    }

    fn partial_args(
        items: &[String],
        body: &str,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> TransmissionHandlerArgs {
        let transmission = GzipSerializer::new().serialize(items).unwrap();
        TransmissionHandlerArgs {
            transmission,
            dispatcher: Some(dispatcher),
            response_body: Some(body.to_string()),
            status: PARTIAL_CONTENT,
            retry_after: None,
        }
    }

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{{\"seq\":{i}}}")).collect()
    }

    #[test]
    fn resends_only_retryable_items() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();
        let body = r#"{"itemsReceived":3,"itemsAccepted":1,"errors":[
            {"index":0,"statusCode":400,"message":"bad item"},
            {"index":2,"statusCode":503,"message":"server busy"}
        ]}"#;

        let sent = items(3);
        assert!(handler.on_transmission_sent(&partial_args(&sent, body, dispatcher.clone())));

        let dispatched = dispatcher.dispatched.lock();
        assert_eq!(dispatched.len(), 1);
        let resent = GzipSerializer::new()
            .reconstruct_items(&dispatched[0])
            .unwrap();
        assert_eq!(resent, vec![sent[2].clone()]);
    }

    #[test]
    fn ignores_non_partial_status() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();
        let mut args = partial_args(&items(2), "{}", dispatcher.clone());
        args.status = 500;

        assert!(!handler.on_transmission_sent(&args));
        assert!(dispatcher.dispatched.lock().is_empty());
    }

    #[test]
    fn desync_guard_rejects_mismatched_counts() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();
        let body = r#"{"itemsReceived":5,"itemsAccepted":1,"errors":[
            {"index":1,"statusCode":503,"message":""}
        ]}"#;

        assert!(!handler.on_transmission_sent(&partial_args(&items(3), body, dispatcher.clone())));
        assert!(dispatcher.dispatched.lock().is_empty());
    }

    #[test]
    fn malformed_body_resends_nothing() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();

        assert!(!handler.on_transmission_sent(&partial_args(
            &items(2),
            "not json at all",
            dispatcher.clone()
        )));
        assert!(dispatcher.dispatched.lock().is_empty());
    }

    #[test]
    fn negative_index_is_skipped() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();
        let body = r#"{"itemsReceived":2,"itemsAccepted":1,"errors":[
            {"index":-1,"statusCode":500,"message":""}
        ]}"#;

        assert!(!handler.on_transmission_sent(&partial_args(&items(2), body, dispatcher.clone())));
        assert!(dispatcher.dispatched.lock().is_empty());
    }

    #[test]
    fn retry_batch_inherits_send_count() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let handler = PartialSuccessHandler::new();
        let body = r#"{"itemsReceived":2,"itemsAccepted":1,"errors":[
            {"index":1,"statusCode":429,"message":""}
        ]}"#;

        let args = partial_args(&items(2), body, dispatcher.clone());
        args.transmission.increment_sends();
        args.transmission.increment_sends();

        assert!(handler.on_transmission_sent(&args));
        assert_eq!(dispatcher.dispatched.lock()[0].number_of_sends(), 2);
    }
}
