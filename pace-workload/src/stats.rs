//! Run statistics.

use std::time::{Duration, Instant};

use hdrhistogram::Histogram;

use crate::counters::OpKind;

/// Per-kind completion counts and latencies.
#[derive(Debug, Clone)]
pub struct KindStats {
    /// Successful completions.
    pub ok: u64,
    /// Failed completions, timeouts included.
    pub failed: u64,
    /// Completion latency in microseconds.
    pub latency: Histogram<u64>,
}

impl KindStats {
    fn new() -> Self {
        Self {
            ok: 0,
            failed: 0,
            latency: Histogram::<u64>::new(3).expect("histogram creation"),
        }
    }

    /// Latency at a quantile, in milliseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn latency_ms(&self, quantile: f64) -> f64 {
        self.latency.value_at_quantile(quantile) as f64 / 1000.0
    }
}

/// Statistics collected over a run.
#[derive(Debug, Clone)]
pub struct RunStats {
    started: Instant,
    kinds: [KindStats; 4],
    /// Fetches that found no value.
    pub not_found: u64,
    /// Batches started.
    pub batches: u64,
    /// Completed cycles.
    pub cycles: u64,
    /// Connections opened after the first.
    pub reconnects: u64,
    /// Batches abandoned on submission failure.
    pub submit_failures: u64,
    /// Completions for unknown tokens.
    pub stray_completions: u64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    /// Creates empty statistics; the run clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            kinds: [
                KindStats::new(),
                KindStats::new(),
                KindStats::new(),
                KindStats::new(),
            ],
            not_found: 0,
            batches: 0,
            cycles: 0,
            reconnects: 0,
            submit_failures: 0,
            stray_completions: 0,
        }
    }

    /// Statistics for one kind.
    #[must_use]
    pub const fn kind(&self, kind: OpKind) -> &KindStats {
        &self.kinds[slot(kind)]
    }

    /// Records a completion. Latencies past the histogram's range are
    /// clamped to its highest value.
    pub fn record(&mut self, kind: OpKind, ok: bool, latency: Duration) {
        let stats = &mut self.kinds[slot(kind)];
        if ok {
            stats.ok += 1;
        } else {
            stats.failed += 1;
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        stats.latency.saturating_record(micros);
    }

    /// Time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Prints a human-readable summary.
    pub fn print_summary(&self) {
        println!("=== Run Statistics ===");
        println!(
            "Cycles: {} batches: {} reconnects: {} abandoned batches: {}",
            self.cycles, self.batches, self.reconnects, self.submit_failures
        );
        for kind in [OpKind::Store, OpKind::Fetch, OpKind::View] {
            let stats = self.kind(kind);
            if stats.ok + stats.failed == 0 {
                continue;
            }
            println!(
                "{kind}: {} ok, {} failed, p50={:.2}ms p99={:.2}ms max={:.2}ms",
                stats.ok,
                stats.failed,
                stats.latency_ms(0.5),
                stats.latency_ms(0.99),
                stats.latency_ms(1.0)
            );
        }
        if self.not_found > 0 {
            println!("Not found: {}", self.not_found);
        }
        println!("Duration: {}ms", self.elapsed().as_millis());
    }
}

const fn slot(kind: OpKind) -> usize {
    match kind {
        OpKind::Connect => 0,
        OpKind::Store => 1,
        OpKind::Fetch => 2,
        OpKind::View => 3,
    }
}
