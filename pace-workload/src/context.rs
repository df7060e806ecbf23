//! Mutable run state owned by the controller.
//!
//! Everything the completion handlers and the phase logic share lives in one
//! [`RunContext`]: the run state, the pending counters, the in-flight request
//! table and the statistics. Requests are only ever submitted through a
//! [`Submitter`], which increments the counters after the transport accepts
//! a request and never before.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::connection::{Connection, SubmitError, Token};
use crate::counters::{CounterError, OpKind, PendingCounters};
use crate::stats::RunStats;

/// Connection-level run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No connection.
    Uninitialized,
    /// Connect submitted, waiting for configuration.
    Connecting,
    /// Connected and issuing batches.
    Ready,
    /// Waiting for outstanding work before releasing the connection.
    Draining,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Draining => "draining",
        })
    }
}

/// Why the current drain started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainCause {
    /// External interrupt.
    Interrupt,
    /// Transport error on the connection.
    TransportFailure(String),
    /// A batch was abandoned on submission failure.
    SubmitFailure(SubmitError),
    /// The configured number of cycles completed.
    Completed,
}

/// Bookkeeping for one submitted request.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Request kind.
    pub kind: OpKind,
    /// Key serial, for store and fetch requests.
    pub serial: Option<u64>,
    /// Key, for store and fetch requests.
    pub key: Option<String>,
    /// Submission time.
    pub submitted_at: Instant,
}

/// State shared by the controller, its handlers and the workload.
#[derive(Debug)]
pub struct RunContext {
    state: RunState,
    counters: PendingCounters,
    shutdown_requested: bool,
    drain_cause: Option<DrainCause>,
    inflight: HashMap<Token, InFlight>,
    next_token: u64,
    batch_open: bool,
    overlapping_batches: u64,
    stats: RunStats,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    /// Creates a context in [`RunState::Uninitialized`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RunState::Uninitialized,
            counters: PendingCounters::new(),
            shutdown_requested: false,
            drain_cause: None,
            inflight: HashMap::new(),
            next_token: 0,
            batch_open: false,
            overlapping_batches: 0,
            stats: RunStats::new(),
        }
    }

    /// Current run state.
    #[must_use]
    pub const fn state(&self) -> RunState {
        self.state
    }

    /// Pending counters.
    #[must_use]
    pub const fn counters(&self) -> &PendingCounters {
        &self.counters
    }

    /// Run statistics.
    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    /// True once an interrupt or the cycle limit asked the run to end.
    #[must_use]
    pub const fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Why the current (or last) drain started.
    #[must_use]
    pub const fn drain_cause(&self) -> Option<&DrainCause> {
        self.drain_cause.as_ref()
    }

    /// Number of requests awaiting completion.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Batches started while earlier work was still outstanding. Always zero
    /// unless the phase gate is broken.
    #[must_use]
    pub const fn overlapping_batches(&self) -> u64 {
        self.overlapping_batches
    }

    pub(crate) const fn batch_open(&self) -> bool {
        self.batch_open
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "state transition");
            self.state = state;
        }
    }

    /// Connect was submitted on a fresh connection.
    pub(crate) fn connecting(&mut self) {
        self.counters.increment(OpKind::Connect);
        self.drain_cause = None;
        self.set_state(RunState::Connecting);
    }

    /// Settles all outstanding connect requests.
    pub(crate) fn connect_settled(&mut self) {
        self.counters.clear(OpKind::Connect);
    }

    /// Forces the run into [`RunState::Draining`]. The first cause wins.
    pub(crate) fn begin_drain(&mut self, cause: DrainCause) {
        if cause == DrainCause::Interrupt || cause == DrainCause::Completed {
            self.shutdown_requested = true;
        }
        if self.drain_cause.is_none() {
            self.drain_cause = Some(cause);
        }
        if self.state != RunState::Draining && self.state != RunState::Uninitialized {
            tracing::info!(cause = ?self.drain_cause, pending = %self.counters, "draining");
            self.set_state(RunState::Draining);
        }
    }

    /// Marks the start of a batch.
    pub(crate) fn begin_batch(&mut self) {
        if !self.counters.all_zero() {
            self.overlapping_batches += 1;
            tracing::error!(pending = %self.counters, "batch started with work outstanding");
        }
        self.batch_open = true;
        self.stats.batches += 1;
    }

    /// Marks the open batch as finished or abandoned.
    pub(crate) fn close_batch(&mut self) {
        self.batch_open = false;
    }

    /// Resolves a completion against the in-flight table.
    ///
    /// Returns `None` for tokens that are unknown, already completed or of
    /// the wrong kind; those completions change nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a tracked request has no pending count left.
    pub(crate) fn complete(
        &mut self,
        token: Token,
        kind: OpKind,
        ok: bool,
    ) -> Result<Option<InFlight>, CounterError> {
        match self.inflight.get(&token) {
            Some(entry) if entry.kind == kind => {}
            Some(entry) => {
                tracing::warn!(
                    %token,
                    expected = %entry.kind,
                    got = %kind,
                    "completion kind mismatch"
                );
                self.stats.stray_completions += 1;
                return Ok(None);
            }
            None => {
                tracing::warn!(%token, %kind, "completion for unknown request");
                self.stats.stray_completions += 1;
                return Ok(None);
            }
        }

        self.counters.decrement(kind)?;
        let entry = self.inflight.remove(&token);
        if let Some(entry) = &entry {
            self.stats.record(kind, ok, entry.submitted_at.elapsed());
        }
        Ok(entry)
    }

    fn issue_token(&mut self) -> Token {
        let token = Token::new(self.next_token);
        self.next_token += 1;
        token
    }

    fn track(&mut self, token: Token, kind: OpKind, serial: Option<u64>, key: Option<String>) {
        self.counters.increment(kind);
        self.inflight.insert(
            token,
            InFlight {
                kind,
                serial,
                key,
                submitted_at: Instant::now(),
            },
        );
    }
}

/// Submits requests on a connection and accounts for them in the context.
pub struct Submitter<'a, C> {
    conn: &'a mut C,
    ctx: &'a mut RunContext,
    submitted: usize,
}

impl<'a, C: Connection> Submitter<'a, C> {
    pub(crate) fn new(conn: &'a mut C, ctx: &'a mut RunContext) -> Self {
        Self {
            conn,
            ctx,
            submitted: 0,
        }
    }

    /// Requests accepted through this submitter.
    #[must_use]
    pub const fn submitted(&self) -> usize {
        self.submitted
    }

    /// Submits a store.
    ///
    /// # Errors
    ///
    /// Returns the transport's submission error; nothing is accounted then.
    pub fn store(&mut self, serial: u64, key: String, value: Bytes) -> Result<Token, SubmitError> {
        let token = self.ctx.issue_token();
        self.conn.store(token, &key, value)?;
        self.ctx.track(token, OpKind::Store, Some(serial), Some(key));
        self.submitted += 1;
        Ok(token)
    }

    /// Submits a fetch.
    ///
    /// # Errors
    ///
    /// Returns the transport's submission error; nothing is accounted then.
    pub fn fetch(&mut self, serial: u64, key: String) -> Result<Token, SubmitError> {
        let token = self.ctx.issue_token();
        self.conn.fetch(token, &key)?;
        self.ctx.track(token, OpKind::Fetch, Some(serial), Some(key));
        self.submitted += 1;
        Ok(token)
    }

    /// Submits a view query.
    ///
    /// # Errors
    ///
    /// Returns the transport's submission error; nothing is accounted then.
    pub fn view(&mut self, path: &str) -> Result<Token, SubmitError> {
        let token = self.ctx.issue_token();
        self.conn.query_view(token, path)?;
        self.ctx.track(token, OpKind::View, None, None);
        self.submitted += 1;
        Ok(token)
    }
}
