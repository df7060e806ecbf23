//! Wire representation of documents and view responses.
//!
//! Documents travel as compact JSON objects. Decoding only checks shape;
//! digest verification is left to [`Document::verify`] so callers can tell a
//! malformed value apart from a corrupted one.

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::document::Document;

/// Errors that can occur while encoding or decoding wire values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value is not a JSON document of the expected shape.
    #[error("malformed value: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes a document as compact JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_document(document: &Document) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(document)?))
}

/// Decodes a document from its JSON wire form.
///
/// # Errors
///
/// Returns an error if the bytes are not a JSON document.
pub fn decode_document(bytes: &[u8]) -> Result<Document, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Aggregate part of a view query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ViewSummary {
    /// Number of rows the view reports.
    pub total_rows: u64,
}

/// Decodes the aggregate summary of a view response.
///
/// Row contents are ignored; only `total_rows` is consulted.
///
/// # Errors
///
/// Returns an error if the body is not JSON or lacks `total_rows`.
pub fn decode_view_summary(body: &[u8]) -> Result<ViewSummary, CodecError> {
    Ok(serde_json::from_slice(body)?)
}
