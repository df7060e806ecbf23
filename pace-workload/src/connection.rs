//! Transport abstraction between the driver and a key-value store.
//!
//! A [`Connector`] opens one [`Connection`] at a time. Every request on the
//! connection is submitted synchronously and completes asynchronously: the
//! outcome is posted as an [`Event`] on the driver's completion queue. The
//! same driver logic runs against:
//! - [`MemoryConnector`](crate::memory::MemoryConnector): an in-process store
//!   with latency jitter and fault injection
//! - [`MemcacheConnector`](crate::memcache::MemcacheConnector): a memcached
//!   text-protocol server plus an HTTP view endpoint

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Sending half of the completion queue.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Correlates a submitted request with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    /// Creates a token from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messages delivered on the completion queue.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection finished configuring and accepts work.
    Configured {
        /// Connection the event belongs to.
        generation: u64,
    },

    /// The connection failed as a whole. Not tied to any one request.
    TransportFailed {
        /// Connection the event belongs to.
        generation: u64,
        /// Human-readable reason.
        message: String,
    },

    /// A store request completed.
    Stored {
        /// Request token.
        token: Token,
        /// Outcome.
        result: Result<(), OpError>,
    },

    /// A fetch request completed.
    Fetched {
        /// Request token.
        token: Token,
        /// Value on success.
        result: Result<Bytes, OpError>,
    },

    /// A view query completed.
    Viewed {
        /// Request token.
        token: Token,
        /// Response body on success.
        result: Result<Bytes, OpError>,
    },

    /// External interrupt (SIGINT or a test harness).
    Interrupt,
}

/// Per-operation failure reported through a completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    /// Operation exceeded its configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Key does not exist.
    #[error("key not found")]
    NotFound,

    /// Server refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// View endpoint answered with a non-success status.
    #[error("http status {0}")]
    Http(u16),

    /// Connection-level I/O failure while the request was in flight.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Synchronous submission failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Too many requests outstanding.
    #[error("back-pressure: {limit} requests already in flight")]
    Backpressure {
        /// Configured in-flight limit.
        limit: usize,
    },

    /// Connection is not usable.
    #[error("connection closed")]
    Closed,

    /// The transport cannot express the request.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Failure to create a connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint string cannot be used.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// Offending endpoint.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The store refused to hand out a connection.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Creates connections to one store endpoint.
pub trait Connector {
    /// Connection type produced.
    type Connection: Connection;

    /// Creates a connection that posts its events to `events`.
    ///
    /// Nothing is sent over the network until [`Connection::connect`].
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be created.
    fn open(
        &mut self,
        generation: u64,
        events: EventSender,
    ) -> Result<Self::Connection, TransportError>;
}

/// One logical connection to the store.
///
/// Every method returns as soon as the request is queued. Exactly one
/// completion event follows each accepted request; a rejected submission
/// produces no event. Dropping the connection releases it.
pub trait Connection {
    /// Submits the initial connect. Completes with [`Event::Configured`] or
    /// [`Event::TransportFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be submitted.
    fn connect(&mut self) -> Result<(), SubmitError>;

    /// Submits a store of `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be submitted.
    fn store(&mut self, token: Token, key: &str, value: Bytes) -> Result<(), SubmitError>;

    /// Submits a fetch of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be submitted.
    fn fetch(&mut self, token: Token, key: &str) -> Result<(), SubmitError>;

    /// Submits an aggregate view query.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be submitted.
    fn query_view(&mut self, token: Token, path: &str) -> Result<(), SubmitError>;
}

/// Runs `fut` under `timeout`, mapping expiry to [`OpError::Timeout`].
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, OpError>
where
    F: Future<Output = Result<T, OpError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(OpError::Timeout(timeout)))
}

/// Posts an event, ignoring a closed queue.
///
/// The queue only closes once the driver has stopped, at which point late
/// completions are meaningless.
pub(crate) fn post(events: &EventSender, event: Event) {
    if events.send(event).is_err() {
        tracing::trace!("completion queue closed, dropping event");
    }
}
