//! Side-channel artifacts for offending values.

use std::path::PathBuf;

use thiserror::Error;

/// Failure to persist an artifact.
#[derive(Debug, Error)]
#[error("failed to write artifact {path}: {source}")]
pub struct CaptureError {
    /// Artifact path.
    pub path: PathBuf,
    /// Underlying error.
    #[source]
    pub source: std::io::Error,
}

/// Writes raw values to `<dir>/invalid_<serial>`.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    dir: PathBuf,
}

impl CaptureSink {
    /// Creates a sink writing into `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the artifact for a serial.
    #[must_use]
    pub fn path_for(&self, serial: u64) -> PathBuf {
        self.dir.join(format!("invalid_{serial}"))
    }

    /// Writes `bytes` verbatim, replacing any earlier artifact for the serial.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, serial: u64, bytes: &[u8]) -> Result<PathBuf, CaptureError> {
        let path = self.path_for(serial);
        std::fs::write(&path, bytes).map_err(|source| CaptureError {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), bytes = bytes.len(), "wrote artifact");
        Ok(path)
    }
}
