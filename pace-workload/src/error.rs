//! Top-level driver errors and process exit codes.

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::connection::{SubmitError, TransportError};
use crate::counters::CounterError;
use crate::violation::Violation;

/// Exit code for a clean run, including an intentional capture.
pub const EXIT_OK: u8 = 0;

/// Exit code for configuration, setup and connection failures.
pub const EXIT_SETUP: u8 = 1;

/// Exit code for a detected data-integrity violation.
pub const EXIT_INTEGRITY: u8 = 2;

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Connection could not be created.
    #[error("failed to open connection: {0}")]
    Open(#[from] TransportError),

    /// Initial connect request could not be submitted.
    #[error("failed to submit connect: {0}")]
    ConnectSubmit(SubmitError),

    /// Connection failed and reconnecting is disabled.
    #[error("connection lost: {message}")]
    ConnectionLost {
        /// Transport-level reason.
        message: String,
    },

    /// A batch was abandoned on submission failure and reconnecting is
    /// disabled.
    #[error("submission failed: {0}")]
    Submit(SubmitError),

    /// Integrity violation.
    #[error("{violation}")]
    Integrity {
        /// What was violated.
        violation: Violation,
        /// Artifact holding the offending value, if one was written.
        artifact: Option<PathBuf>,
    },

    /// Artifact could not be written.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Completion bookkeeping is inconsistent.
    #[error("completion accounting broken: {0}")]
    Accounting(#[from] CounterError),

    /// Completion queue closed while work was outstanding.
    #[error("event loop closed")]
    EventLoopClosed,
}

impl DriverError {
    /// Returns the process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Integrity { .. } => EXIT_INTEGRITY,
            Self::Config(_)
            | Self::Open(_)
            | Self::ConnectSubmit(_)
            | Self::ConnectionLost { .. }
            | Self::Submit(_)
            | Self::Capture(_)
            | Self::Accounting(_)
            | Self::EventLoopClosed => EXIT_SETUP,
        }
    }

    /// Returns the violation, if this is an integrity failure.
    #[must_use]
    pub const fn violation(&self) -> Option<&Violation> {
        match self {
            Self::Integrity { violation, .. } => Some(violation),
            _ => None,
        }
    }
}
