//! Pace: phase-gated workload driver for key-value stores
//!
//! Drives a remote, eventually-consistent key-value store through bulk
//! writes, bulk reads and an aggregate consistency query, and verifies every
//! value it reads back:
//!
//! 1. **Phase gating** - a batch starts only after every request of the
//!    previous batch has completed
//! 2. **Integrity checking** - every document carries a digest of its own
//!    blob; mismatches, lost writes and unexpected view counts are fatal
//! 3. **Fault capture** - offending values are written verbatim to disk
//!
//! # Architecture
//!
//! One [`Controller`] owns one connection at a time and runs on a single
//! thread. Requests are submitted synchronously; completions arrive as
//! [`Event`]s on the controller's queue. The same controller runs against:
//! - [`MemoryConnector`]: in-process store with fault injection
//! - [`MemcacheConnector`]: memcached text protocol plus an HTTP view
//!
//! # Example
//!
//! ```ignore
//! use pace_workload::{load_profile, Controller, MemoryConnector, MemoryStore};
//!
//! let config = load_profile("readback")?;
//! let connector = MemoryConnector::new(MemoryStore::new(), config.timeouts);
//! let mut controller = Controller::new(config, connector)?;
//!
//! let outcome = controller.run().await?;
//! controller.stats().print_summary();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod capture;
mod codec;
mod context;
mod controller;
mod counters;
mod document;
mod error;
mod event_loop;
mod keys;
mod stats;
mod violation;
mod workload;

pub mod config;
pub mod connection;
pub mod memcache;
pub mod memory;

pub use capture::{CaptureError, CaptureSink};
pub use codec::{decode_document, decode_view_summary, encode_document, CodecError, ViewSummary};
pub use context::{DrainCause, InFlight, RunContext, RunState, Submitter};
pub use controller::{Controller, Outcome};
pub use counters::{CounterError, OpKind, PendingCounters};
pub use document::{
    digest, soak_pattern, Document, DocumentError, DOCUMENT_SIZE_MAX, DOCUMENT_SIZE_MIN,
};
pub use error::{DriverError, EXIT_INTEGRITY, EXIT_OK, EXIT_SETUP};
pub use event_loop::{EventLoop, InterruptHandle};
pub use keys::{KeyAllocator, KeyPolicy};
pub use stats::{KindStats, RunStats};
pub use violation::{first_difference, Violation};
pub use workload::{Verdict, Workload};

// Re-export configuration and transport types.
pub use config::{
    builtin_profiles, list_profiles, load_profile, ConfigError, DriverConfig, DriverConfigBuilder,
    SizeDistribution, Timeouts, WorkloadMode, MEMORY_ENDPOINT,
};
pub use connection::{
    Connection, Connector, Event, EventSender, OpError, SubmitError, Token, TransportError,
};
pub use memcache::{MemcacheConnection, MemcacheConnector};
pub use memory::{MemoryConnection, MemoryConnector, MemoryStore, ViewKind};
