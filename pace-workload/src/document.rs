//! Self-verifying documents.
//!
//! Every document carries a digest of its own blob so a reader can detect
//! corruption without any external state. Generation is pure and
//! deterministic: the same seed or serial always yields the same bytes.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest blob the generators will produce.
pub const DOCUMENT_SIZE_MIN: usize = 1;

/// Largest blob the generators will produce (20 MiB).
pub const DOCUMENT_SIZE_MAX: usize = 20 * 1024 * 1024;

/// Length of a rendered digest in hex characters.
const DIGEST_HEX_LEN: usize = 16;

/// Errors raised when a document fails verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// Digest field is not a 16 digit hex string.
    #[error("malformed digest {0:?}")]
    MalformedDigest(String),

    /// Digest does not match the blob.
    #[error("digest mismatch: stored {stored}, computed {computed}")]
    DigestMismatch {
        /// Digest carried by the document.
        stored: String,
        /// Digest recomputed from the blob.
        computed: String,
    },
}

/// A blob plus the digest computed over it.
///
/// Field names match the wire form: `{"data": "...", "checksum": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Payload blob.
    pub data: String,
    /// CRC-64 of `data` as 16 lowercase hex digits.
    pub checksum: String,
}

impl Document {
    /// Wraps a blob, computing its digest.
    #[must_use]
    pub fn new(data: String) -> Self {
        let checksum = digest(data.as_bytes());
        Self { data, checksum }
    }

    /// Builds the fixed digit-cycle document (`0123456789012...`).
    ///
    /// Every call with the same size yields an identical document, which is
    /// what the consistency workload writes on every pass.
    #[must_use]
    pub fn from_pattern(size: usize) -> Self {
        let data = (0..size)
            .map(|i| char::from(b'0' + u8::try_from(i % 10).unwrap_or(0)))
            .collect();
        Self::new(data)
    }

    /// Generates a random alphanumeric document of the given size.
    #[must_use]
    pub fn generate<R: Rng>(rng: &mut R, size: usize) -> Self {
        let data = rng
            .sample_iter(&Alphanumeric)
            .take(size)
            .map(char::from)
            .collect();
        Self::new(data)
    }

    /// Checks the digest invariant.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored digest is malformed or does not match.
    pub fn verify(&self) -> Result<(), DocumentError> {
        if self.checksum.len() != DIGEST_HEX_LEN
            || !self.checksum.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(DocumentError::MalformedDigest(self.checksum.clone()));
        }

        let computed = digest(self.data.as_bytes());
        if !computed.eq_ignore_ascii_case(&self.checksum) {
            return Err(DocumentError::DigestMismatch {
                stored: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Returns the blob length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the blob is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Computes the CRC-64/ECMA-182 digest of `bytes` as lowercase hex.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    use crc::{Crc, CRC_64_ECMA_182};

    const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

    format!("{:016x}", CRC64.checksum(bytes))
}

/// Raw soak pattern for a key serial: `size` copies of the serial's low byte.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Only the low byte is wanted.
pub fn soak_pattern(serial: u64, size: usize) -> Vec<u8> {
    vec![serial as u8; size]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_generated_documents_verify() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for size in [1, 10, 1024, 64 * 1024] {
            let doc = Document::generate(&mut rng, size);
            assert_eq!(doc.len(), size);
            assert!(doc.verify().is_ok(), "size {size} failed verification");
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let mut rng1 = ChaCha8Rng::seed_from_u64(42);
        let mut rng2 = ChaCha8Rng::seed_from_u64(42);
        assert_eq!(
            Document::generate(&mut rng1, 256),
            Document::generate(&mut rng2, 256)
        );
    }

    #[test]
    fn test_pattern_document() {
        let doc = Document::from_pattern(12);
        assert_eq!(doc.data, "012345678901");
        assert!(doc.verify().is_ok());
        assert_eq!(doc, Document::from_pattern(12));
    }

    #[test]
    fn test_tampered_blob_detected() {
        let mut doc = Document::from_pattern(64);
        doc.data.replace_range(10..11, "x");
        assert!(matches!(
            doc.verify(),
            Err(DocumentError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_digest_detected() {
        let doc = Document {
            data: "abc".to_string(),
            checksum: "not-hex".to_string(),
        };
        assert!(matches!(doc.verify(), Err(DocumentError::MalformedDigest(_))));
    }

    #[test]
    fn test_digest_is_fixed_width() {
        assert_eq!(digest(b"").len(), DIGEST_HEX_LEN);
        assert_eq!(digest(b"hello").len(), DIGEST_HEX_LEN);
        assert_ne!(digest(b"hello"), digest(b"hellp"));
    }

    #[test]
    fn test_soak_pattern() {
        assert_eq!(soak_pattern(3, 4), vec![3, 3, 3, 3]);
        assert_eq!(soak_pattern(257, 2), vec![1, 1]);
    }
}
