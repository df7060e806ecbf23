//! Pending-operation counters.
//!
//! One counter per operation kind. The driver runs on a single thread, so
//! plain integers are enough: the counters act as a cooperative semaphore
//! gating every phase transition.

use std::fmt;

use thiserror::Error;

/// Kinds of operations tracked by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    /// Connect / configuration request.
    Connect,
    /// Single-key store.
    Store,
    /// Single-key fetch.
    Fetch,
    /// Aggregate view query.
    View,
}

impl OpKind {
    /// All kinds, in reporting order.
    pub const ALL: [Self; 4] = [Self::Connect, Self::Store, Self::Fetch, Self::View];

    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "conf",
            Self::Store => "store",
            Self::Fetch => "fetch",
            Self::View => "view",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Connect => 0,
            Self::Store => 1,
            Self::Fetch => 2,
            Self::View => 3,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CounterError {
    /// A completion arrived for a kind with nothing outstanding.
    #[error("{0} counter would go negative")]
    Underflow(OpKind),
}

/// Outstanding operation counts per kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingCounters {
    counts: [u64; 4],
}

impl PendingCounters {
    /// Creates counters with everything at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { counts: [0; 4] }
    }

    /// Records a successfully submitted operation.
    pub fn increment(&mut self, kind: OpKind) {
        self.counts[kind.index()] += 1;
    }

    /// Records a completed operation.
    ///
    /// # Errors
    ///
    /// Returns [`CounterError::Underflow`] if the counter is already zero;
    /// the counter is left untouched.
    pub fn decrement(&mut self, kind: OpKind) -> Result<(), CounterError> {
        let slot = &mut self.counts[kind.index()];
        *slot = slot.checked_sub(1).ok_or(CounterError::Underflow(kind))?;
        Ok(())
    }

    /// Returns the outstanding count for a kind.
    #[must_use]
    pub const fn get(&self, kind: OpKind) -> u64 {
        self.counts[kind.index()]
    }

    /// Returns true iff nothing is outstanding.
    #[must_use]
    pub fn all_zero(&self) -> bool {
        self.counts.iter().all(|&c| c == 0)
    }

    /// Total outstanding operations across all kinds.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Forgets every outstanding operation of a kind.
    ///
    /// Used for connect requests: one configuration settles all of them.
    pub fn clear(&mut self, kind: OpKind) {
        self.counts[kind.index()] = 0;
    }
}

impl fmt::Display for PendingCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "conf:{} store:{} fetch:{} view:{}",
            self.get(OpKind::Connect),
            self.get(OpKind::Store),
            self.get(OpKind::Fetch),
            self.get(OpKind::View)
        )
    }
}
