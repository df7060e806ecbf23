//! Data-integrity violations.
//!
//! Every variant is fatal: the driver stops at the first one and exits with
//! the integrity code.

use std::fmt;

/// A violation of a data-integrity property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A fetched document's digest does not match its blob.
    DigestMismatch {
        /// Key fetched.
        key: String,
        /// Digest carried by the document.
        stored: String,
        /// Digest recomputed from the blob.
        computed: String,
    },

    /// A fetched value is not a document at all.
    Undecodable {
        /// Key fetched.
        key: String,
        /// Decoder message.
        reason: String,
    },

    /// A document verifies but is not the one this batch stored.
    LostWrite {
        /// Key fetched.
        key: String,
        /// Digest of the document that was stored.
        expected: String,
        /// Digest of the document that came back.
        observed: String,
    },

    /// A raw soak value differs from the pattern for its serial.
    PatternMismatch {
        /// Key fetched.
        key: String,
        /// Key serial.
        serial: u64,
        /// Offset of the first differing byte, or the shorter length.
        offset: usize,
    },

    /// The consistency view reported an unexpected row count.
    CardinalityMismatch {
        /// Rows the view must report.
        expected: u64,
        /// Rows it reported.
        observed: u64,
    },

    /// The view response could not be parsed.
    MalformedView {
        /// Decoder message.
        reason: String,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DigestMismatch {
                key,
                stored,
                computed,
            } => write!(
                f,
                "Digest mismatch: {key} carries {stored}, blob hashes to {computed}"
            ),
            Self::Undecodable { key, reason } => {
                write!(f, "Undecodable value: {key}: {reason}")
            }
            Self::LostWrite {
                key,
                expected,
                observed,
            } => write!(
                f,
                "Lost write: {key} was stored as {expected} but read back as {observed}"
            ),
            Self::PatternMismatch {
                key,
                serial,
                offset,
            } => write!(
                f,
                "Pattern mismatch: {key} (serial {serial}) differs at byte {offset}"
            ),
            Self::CardinalityMismatch { expected, observed } => write!(
                f,
                "Cardinality mismatch: view reported {observed} rows, expected {expected}"
            ),
            Self::MalformedView { reason } => write!(f, "Malformed view response: {reason}"),
        }
    }
}

/// Offset of the first byte where `observed` differs from `expected`.
///
/// Returns `None` when the two are identical.
#[must_use]
pub fn first_difference(expected: &[u8], observed: &[u8]) -> Option<usize> {
    expected
        .iter()
        .zip(observed)
        .position(|(a, b)| a != b)
        .or_else(|| (expected.len() != observed.len()).then(|| expected.len().min(observed.len())))
}
