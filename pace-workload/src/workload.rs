//! Workload policies.
//!
//! A [`Workload`] decides what each batch contains and judges every
//! completion. The controller calls [`Workload::on_ready`] only when the run
//! is `Ready` and every pending counter is zero, so a policy never has to
//! reason about overlapping phases.
//!
//! # Modes
//!
//! - `consistency`: view query, then a batch of identical pattern documents
//!   once the view reports the expected row count
//! - `readback`: batch of random documents, then fetch and verify every one
//! - `soak-*`: one raw pattern value per cycle on a rotating key

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use bytes::Bytes;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::capture::CaptureSink;
use crate::codec::{decode_document, decode_view_summary, encode_document};
use crate::config::{DriverConfig, SizeDistribution, WorkloadMode};
use crate::connection::{Connection, OpError, SubmitError};
use crate::context::{InFlight, Submitter};
use crate::document::{digest, soak_pattern, Document, DocumentError};
use crate::error::DriverError;
use crate::keys::KeyAllocator;
use crate::violation::{first_difference, Violation};

/// What the controller should do after a completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Keep going.
    Continue,
    /// A payload was captured on purpose; end the run cleanly.
    Captured(PathBuf),
}

/// Active workload policy.
#[derive(Debug)]
pub enum Workload {
    /// View check, then bulk store.
    Consistency(Consistency),
    /// Bulk store, then bulk fetch and verify.
    Readback(Readback),
    /// Single-key soak.
    Soak(Soak),
}

impl Workload {
    /// Builds the policy selected by `config.mode`.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        let keys = KeyAllocator::new(config.key_prefix.clone(), config.keys);
        let capture = config.capture_dir.clone().map(CaptureSink::new);

        match config.mode {
            WorkloadMode::Consistency => Self::Consistency(Consistency {
                view_path: config.view_path.clone(),
                expected_rows: config.expected_rows,
                batch_size: config.batch_size,
                keys,
                // Sized once: every pass writes the same document.
                document: Document::from_pattern(config.document_size.max()),
                encoded: None,
                step: ConsistencyStep::Check,
                view_ok: false,
            }),
            WorkloadMode::Readback => Self::Readback(Readback {
                rng: ChaCha8Rng::seed_from_u64(config.seed),
                size: config.document_size,
                batch_size: config.batch_size,
                keys,
                capture,
                expected: HashMap::new(),
                failed_stores: HashSet::new(),
                batch: Vec::new(),
                step: ReadbackStep::Write,
            }),
            WorkloadMode::SoakWrite | WorkloadMode::SoakCheck | WorkloadMode::SoakCapture => {
                let mode = match config.mode {
                    WorkloadMode::SoakWrite => SoakMode::Write,
                    WorkloadMode::SoakCheck => SoakMode::Check,
                    _ => SoakMode::Capture,
                };
                Self::Soak(Soak {
                    mode,
                    keys,
                    size: config.document_size.max(),
                    capture,
                })
            }
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Consistency(_) => "consistency",
            Self::Readback(_) => "readback",
            Self::Soak(s) => match s.mode {
                SoakMode::Write => "soak-write",
                SoakMode::Check => "soak-check",
                SoakMode::Capture => "soak-capture",
            },
        }
    }

    /// Issues the next batch.
    ///
    /// # Errors
    ///
    /// Returns the first submission failure; requests accepted before it
    /// stay in flight.
    pub fn on_ready<C: Connection>(
        &mut self,
        sub: &mut Submitter<'_, C>,
    ) -> Result<(), SubmitError> {
        match self {
            Self::Consistency(w) => w.on_ready(sub),
            Self::Readback(w) => w.on_ready(sub),
            Self::Soak(w) => w.on_ready(sub),
        }
    }

    /// Handles a store completion. Store failures are never fatal.
    pub fn on_store(&mut self, entry: &InFlight, result: &Result<(), OpError>) {
        if let (Self::Readback(w), Err(_), Some(serial)) = (self, result, entry.serial) {
            w.failed_stores.insert(serial);
        }
    }

    /// Handles a successful fetch.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Integrity`] when the value violates the
    /// workload's invariant.
    pub fn on_fetched(&mut self, entry: &InFlight, value: &Bytes) -> Result<Verdict, DriverError> {
        let key = entry.key.clone().unwrap_or_default();
        let serial = entry.serial.unwrap_or_default();
        match self {
            Self::Readback(w) => w.verify(serial, key, value).map(|()| Verdict::Continue),
            Self::Soak(w) => w.check(serial, key, value),
            Self::Consistency(_) => Ok(Verdict::Continue),
        }
    }

    /// Handles a view completion.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Integrity`] if the view reports an unexpected
    /// row count or cannot be parsed.
    pub fn on_view(&mut self, result: &Result<Bytes, OpError>) -> Result<(), DriverError> {
        match self {
            Self::Consistency(w) => w.on_view(result),
            _ => Ok(()),
        }
    }

    /// Called once the open batch has fully drained.
    ///
    /// Returns true when this completed a cycle.
    pub fn on_batch_drained(&mut self) -> bool {
        match self {
            Self::Consistency(w) => match w.step {
                ConsistencyStep::Check => {
                    if w.view_ok {
                        w.step = ConsistencyStep::Write;
                    }
                    false
                }
                ConsistencyStep::Write => {
                    w.step = ConsistencyStep::Check;
                    w.view_ok = false;
                    true
                }
            },
            Self::Readback(w) => match w.step {
                ReadbackStep::Write => {
                    w.step = ReadbackStep::Read;
                    false
                }
                ReadbackStep::Read => {
                    w.step = ReadbackStep::Write;
                    true
                }
            },
            Self::Soak(_) => true,
        }
    }

    /// Called when the open batch was abandoned. The next batch restarts
    /// the cycle from its first step.
    pub fn on_abandoned(&mut self) {
        match self {
            Self::Consistency(w) => {
                w.step = ConsistencyStep::Check;
                w.view_ok = false;
            }
            Self::Readback(w) => w.step = ReadbackStep::Write,
            Self::Soak(_) => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsistencyStep {
    Check,
    Write,
}

/// View-gated bulk writer.
#[derive(Debug)]
pub struct Consistency {
    view_path: String,
    expected_rows: u64,
    batch_size: u64,
    keys: KeyAllocator,
    document: Document,
    encoded: Option<Bytes>,
    step: ConsistencyStep,
    view_ok: bool,
}

impl Consistency {
    fn on_ready<C: Connection>(&mut self, sub: &mut Submitter<'_, C>) -> Result<(), SubmitError> {
        match self.step {
            ConsistencyStep::Check => {
                sub.view(&self.view_path)?;
            }
            ConsistencyStep::Write => {
                let value = match &self.encoded {
                    Some(value) => value.clone(),
                    None => {
                        let value = encode_document(&self.document)
                            .map_err(|e| SubmitError::Invalid(e.to_string()))?;
                        self.encoded = Some(value.clone());
                        value
                    }
                };
                for _ in 0..self.batch_size {
                    let (serial, key) = self.keys.next_key();
                    sub.store(serial, key, value.clone())?;
                }
            }
        }
        Ok(())
    }

    fn on_view(&mut self, result: &Result<Bytes, OpError>) -> Result<(), DriverError> {
        let body = match result {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "view query failed, will re-issue");
                self.view_ok = false;
                return Ok(());
            }
        };

        let summary = decode_view_summary(body).map_err(|e| DriverError::Integrity {
            violation: Violation::MalformedView {
                reason: e.to_string(),
            },
            artifact: None,
        })?;

        if summary.total_rows != self.expected_rows {
            return Err(DriverError::Integrity {
                violation: Violation::CardinalityMismatch {
                    expected: self.expected_rows,
                    observed: summary.total_rows,
                },
                artifact: None,
            });
        }

        tracing::debug!(rows = summary.total_rows, "view check passed");
        self.view_ok = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadbackStep {
    Write,
    Read,
}

/// Store-then-verify workload.
#[derive(Debug)]
pub struct Readback {
    rng: ChaCha8Rng,
    size: SizeDistribution,
    batch_size: u64,
    keys: KeyAllocator,
    capture: Option<CaptureSink>,
    /// Digest stored this batch, by serial.
    expected: HashMap<u64, String>,
    failed_stores: HashSet<u64>,
    batch: Vec<(u64, String)>,
    step: ReadbackStep,
}

impl Readback {
    fn on_ready<C: Connection>(&mut self, sub: &mut Submitter<'_, C>) -> Result<(), SubmitError> {
        match self.step {
            ReadbackStep::Write => {
                self.expected.clear();
                self.failed_stores.clear();
                self.batch.clear();
                for _ in 0..self.batch_size {
                    let (serial, key) = self.keys.next_key();
                    let size = self.size.sample(&mut self.rng);
                    let document = Document::generate(&mut self.rng, size);
                    let value = encode_document(&document)
                        .map_err(|e| SubmitError::Invalid(e.to_string()))?;
                    sub.store(serial, key.clone(), value)?;
                    self.expected.insert(serial, document.checksum);
                    self.batch.push((serial, key));
                }
            }
            ReadbackStep::Read => {
                for (serial, key) in &self.batch {
                    sub.fetch(*serial, key.clone())?;
                }
            }
        }
        Ok(())
    }

    fn verify(&self, serial: u64, key: String, value: &Bytes) -> Result<(), DriverError> {
        let document = match decode_document(value) {
            Ok(document) => document,
            Err(e) => {
                let violation = Violation::Undecodable {
                    key,
                    reason: e.to_string(),
                };
                return Err(integrity(self.capture.as_ref(), serial, value, violation));
            }
        };

        match document.verify() {
            Ok(()) => {}
            Err(DocumentError::DigestMismatch { stored, computed }) => {
                let violation = Violation::DigestMismatch {
                    key,
                    stored,
                    computed,
                };
                return Err(integrity(self.capture.as_ref(), serial, value, violation));
            }
            Err(DocumentError::MalformedDigest(stored)) => {
                let violation = Violation::DigestMismatch {
                    key,
                    stored,
                    computed: digest(document.data.as_bytes()),
                };
                return Err(integrity(self.capture.as_ref(), serial, value, violation));
            }
        }

        // A failed store may or may not have landed, so only keys whose
        // store succeeded must read back exactly what was written.
        if !self.failed_stores.contains(&serial) {
            if let Some(expected) = self.expected.get(&serial) {
                if *expected != document.checksum {
                    let violation = Violation::LostWrite {
                        key,
                        expected: expected.clone(),
                        observed: document.checksum,
                    };
                    return Err(integrity(self.capture.as_ref(), serial, value, violation));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoakMode {
    Write,
    Check,
    Capture,
}

/// Single-key soak.
#[derive(Debug)]
pub struct Soak {
    mode: SoakMode,
    keys: KeyAllocator,
    size: usize,
    capture: Option<CaptureSink>,
}

impl Soak {
    fn on_ready<C: Connection>(&mut self, sub: &mut Submitter<'_, C>) -> Result<(), SubmitError> {
        let (serial, key) = self.keys.next_key();
        match self.mode {
            SoakMode::Write => {
                sub.store(serial, key, Bytes::from(soak_pattern(serial, self.size)))?;
            }
            SoakMode::Check | SoakMode::Capture => {
                sub.fetch(serial, key)?;
            }
        }
        Ok(())
    }

    fn check(&self, serial: u64, key: String, value: &Bytes) -> Result<Verdict, DriverError> {
        if self.mode == SoakMode::Capture {
            let Some(sink) = &self.capture else {
                tracing::info!(%key, bytes = value.len(), "fetched value, capture disabled");
                return Ok(Verdict::Continue);
            };
            return Ok(Verdict::Captured(sink.write(serial, value)?));
        }

        let expected = soak_pattern(serial, self.size);
        match first_difference(&expected, value) {
            None => Ok(Verdict::Continue),
            Some(offset) => {
                let violation = Violation::PatternMismatch {
                    key,
                    serial,
                    offset,
                };
                Err(integrity(self.capture.as_ref(), serial, value, violation))
            }
        }
    }
}

/// Builds an integrity error, persisting the offending value when a sink is
/// configured. A failed capture is logged; the violation still wins.
fn integrity(
    sink: Option<&CaptureSink>,
    serial: u64,
    value: &[u8],
    violation: Violation,
) -> DriverError {
    let artifact = sink.and_then(|sink| match sink.write(serial, value) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::error!(error = %e, "failed to capture offending value");
            None
        }
    });
    DriverError::Integrity {
        violation,
        artifact,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::counters::OpKind;
    use crate::keys::KeyPolicy;

    fn fetched(serial: u64) -> InFlight {
        InFlight {
            kind: OpKind::Fetch,
            serial: Some(serial),
            key: Some(format!("key:{serial}")),
            submitted_at: Instant::now(),
        }
    }

    fn readback() -> Readback {
        let config = DriverConfig::builder()
            .mode(WorkloadMode::Readback)
            .keys(KeyPolicy::Unique)
            .batch_size(4)
            .capture_dir(None)
            .build();
        match Workload::from_config(&config) {
            Workload::Readback(w) => w,
            other => panic!("unexpected workload {}", other.name()),
        }
    }

    #[test]
    fn test_from_config_selects_mode() {
        let config = DriverConfig::builder().mode(WorkloadMode::SoakCheck).build();
        assert_eq!(Workload::from_config(&config).name(), "soak-check");
        let config = DriverConfig::default();
        assert_eq!(Workload::from_config(&config).name(), "consistency");
    }

    #[test]
    fn test_consistency_view_gate() {
        let config = DriverConfig::builder().expected_rows(0).build();
        let mut workload = Workload::from_config(&config);

        // A failed view does not open the write step.
        workload.on_view(&Err(OpError::Http(500))).unwrap();
        assert!(!workload.on_batch_drained());
        let Workload::Consistency(w) = &workload else { unreachable!() };
        assert_eq!(w.step, ConsistencyStep::Check);

        workload
            .on_view(&Ok(Bytes::from_static(br#"{"total_rows":0,"rows":[]}"#)))
            .unwrap();
        assert!(!workload.on_batch_drained());
        let Workload::Consistency(w) = &workload else { unreachable!() };
        assert_eq!(w.step, ConsistencyStep::Write);

        // Write drained completes a cycle and goes back to checking.
        assert!(workload.on_batch_drained());
    }

    #[test]
    fn test_consistency_cardinality_mismatch() {
        let mut workload = Workload::from_config(&DriverConfig::default());
        let err = workload
            .on_view(&Ok(Bytes::from_static(br#"{"total_rows":5,"rows":[]}"#)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::CardinalityMismatch {
                expected: 0,
                observed: 5
            })
        );
    }

    #[test]
    fn test_readback_detects_digest_mismatch() {
        let w = readback();
        let mut doc = Document::from_pattern(32);
        doc.data.replace_range(0..1, "x");
        let value = encode_document(&doc).unwrap();

        let err = w.verify(0, "key:0".to_string(), &value).unwrap_err();
        assert!(matches!(
            err.violation(),
            Some(Violation::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_readback_detects_lost_write() {
        let mut w = readback();
        w.expected.insert(0, Document::from_pattern(10).checksum);
        let stale = encode_document(&Document::from_pattern(11)).unwrap();

        let err = w.verify(0, "key:0".to_string(), &stale).unwrap_err();
        assert!(matches!(err.violation(), Some(Violation::LostWrite { .. })));

        // Not a lost write if the store itself failed.
        w.failed_stores.insert(0);
        assert!(w.verify(0, "key:0".to_string(), &stale).is_ok());
    }

    #[test]
    fn test_readback_store_failure_recorded() {
        let mut workload = Workload::Readback(readback());
        let mut entry = fetched(2);
        entry.kind = OpKind::Store;
        workload.on_store(&entry, &Err(OpError::Timeout(std::time::Duration::from_secs(1))));
        let Workload::Readback(w) = &workload else { unreachable!() };
        assert!(w.failed_stores.contains(&2));
    }

    #[test]
    fn test_soak_check_pattern() {
        let config = DriverConfig::builder()
            .mode(WorkloadMode::SoakCheck)
            .document_size(SizeDistribution::Fixed(8))
            .capture_dir(None)
            .build();
        let mut workload = Workload::from_config(&config);

        let good = Bytes::from(soak_pattern(5, 8));
        assert_eq!(workload.on_fetched(&fetched(5), &good).unwrap(), Verdict::Continue);

        let mut bad = soak_pattern(5, 8);
        bad[6] = 0;
        let err = workload
            .on_fetched(&fetched(5), &Bytes::from(bad))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&Violation::PatternMismatch {
                key: "key:5".to_string(),
                serial: 5,
                offset: 6
            })
        );
    }

    #[test]
    fn test_soak_capture_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig::builder()
            .mode(WorkloadMode::SoakCapture)
            .capture_dir(Some(dir.path().to_path_buf()))
            .build();
        let mut workload = Workload::from_config(&config);

        let verdict = workload
            .on_fetched(&fetched(9), &Bytes::from_static(b"anything"))
            .unwrap();
        let path = dir.path().join("invalid_9");
        assert_eq!(verdict, Verdict::Captured(path.clone()));
        assert_eq!(std::fs::read(path).unwrap(), b"anything");
    }
}
