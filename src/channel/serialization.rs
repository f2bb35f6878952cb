use super::transmission::{CONTENT_ENCODING_GZIP, CONTENT_TYPE_JSON_STREAM, Transmission};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Batch is empty")]
    EmptyBatch,
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Builds gzip-compressed newline-delimited payloads from already-serialized
/// telemetry items, and reconstructs the item list from a payload.
///
/// Reconstruction must split lines exactly the way serialization joined them:
/// the backend reports rejected items by zero-based line index into the
/// request body.
#[derive(Debug, Clone, Default)]
pub struct GzipSerializer;

impl GzipSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Serializes items into a gzip-compressed transmission.
    pub fn serialize(&self, items: &[String]) -> Result<Transmission, SerializationError> {
        if items.is_empty() {
            return Err(SerializationError::EmptyBatch);
        }

        let body = items.join("\r\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(body.as_bytes())?;
        let compressed = encoder.finish()?;

        Ok(Transmission::new(
            compressed,
            CONTENT_TYPE_JSON_STREAM,
            CONTENT_ENCODING_GZIP,
        ))
    }

    /// Serializes items without compression.
    pub fn serialize_raw(&self, items: &[String]) -> Result<Transmission, SerializationError> {
        if items.is_empty() {
            return Err(SerializationError::EmptyBatch);
        }

        let body = items.join("\r\n");
        Ok(Transmission::new(
            body.into_bytes(),
            CONTENT_TYPE_JSON_STREAM,
            "",
        ))
    }

    /// Reconstructs the ordered list of items a transmission was built from.
    pub fn reconstruct_items(
        &self,
        transmission: &Transmission,
    ) -> Result<Vec<String>, SerializationError> {
        if transmission.is_gzipped() {
            let mut decoder = GzDecoder::new(transmission.content().as_ref());
            let mut body = String::new();
            decoder.read_to_string(&mut body)?;
            Ok(body.lines().map(str::to_owned).collect())
        } else {
            let body = String::from_utf8(transmission.content().to_vec())?;
            Ok(body.split("\r\n").map(str::to_owned).collect())
        }
    }
}
