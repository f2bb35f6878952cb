use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

pub const CONTENT_TYPE_JSON_STREAM: &str = "application/x-json-stream";
pub const CONTENT_ENCODING_GZIP: &str = "gzip";

/// One batch of serialized telemetry sent as a single HTTP request body.
///
/// The payload is immutable; the only mutable piece is the send-attempt
/// counter, which is shared across clones so a re-dispatched transmission
/// keeps its accumulated attempt count.
#[derive(Debug, Clone)]
pub struct Transmission {
    id: String,
    content: Bytes,
    content_type: &'static str,
    content_encoding: &'static str,
    number_of_sends: Arc<AtomicU32>,
}

impl Transmission {
    pub fn new(
        content: impl Into<Bytes>,
        content_type: &'static str,
        content_encoding: &'static str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            content_type,
            content_encoding,
            number_of_sends: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    /// Content encoding of the payload, empty when uncompressed.
    pub fn content_encoding(&self) -> &'static str {
        self.content_encoding
    }

    pub fn is_gzipped(&self) -> bool {
        self.content_encoding.eq_ignore_ascii_case(CONTENT_ENCODING_GZIP)
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn number_of_sends(&self) -> u32 {
        self.number_of_sends.load(Ordering::Relaxed)
    }

    /// Records one send attempt and returns the updated count.
    pub fn increment_sends(&self) -> u32 {
        self.number_of_sends.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Carries an attempt count over from a parent transmission so the
    /// instant-retry cap spans re-synthesized batches.
    pub(crate) fn set_sends(&self, count: u32) {
        self.number_of_sends.store(count, Ordering::Relaxed);
    }
}
