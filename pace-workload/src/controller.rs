//! Phase controller.
//!
//! Owns the connection, the run context and the workload, and drives the
//! run state machine:
//!
//! ```text
//! Uninitialized --connect submitted--> Connecting
//! Connecting    --configured---------> Ready
//! Ready         --counters zero------> Ready (next batch)
//! Ready         --interrupt/error----> Draining
//! Draining      --counters zero------> Uninitialized --> exit or reconnect
//! ```
//!
//! A new batch is only issued from `Ready` with every pending counter at
//! zero. Nothing in flight is ever cancelled; draining simply stops issuing
//! work and waits for the counters to reach zero.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::connection::{Connection, Connector, Event, OpError};
use crate::context::{DrainCause, RunContext, RunState, Submitter};
use crate::counters::OpKind;
use crate::error::{DriverError, EXIT_OK};
use crate::event_loop::{EventLoop, InterruptHandle};
use crate::stats::RunStats;
use crate::workload::{Verdict, Workload};

/// How a run ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The configured number of cycles completed.
    Completed,
    /// An interrupt was honoured after draining.
    Interrupted,
    /// A value was captured on purpose.
    Captured {
        /// Artifact path.
        path: PathBuf,
    },
}

impl Outcome {
    /// Process exit code; every clean outcome exits 0.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        EXIT_OK
    }
}

enum Next {
    Wait,
    Reconnect,
    Finish(Outcome),
}

/// Drives one workload over one connection at a time.
pub struct Controller<K: Connector> {
    config: DriverConfig,
    connector: K,
    workload: Workload,
    ctx: RunContext,
    event_loop: EventLoop,
    conn: Option<K::Connection>,
    generation: u64,
    interrupted: bool,
    captured: Option<PathBuf>,
    last_status: Instant,
}

impl<K: Connector> Controller<K> {
    /// Creates a controller for a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Config`] if the configuration is invalid.
    pub fn new(config: DriverConfig, connector: K) -> Result<Self, DriverError> {
        config.validate()?;
        let workload = Workload::from_config(&config);
        Ok(Self {
            config,
            connector,
            workload,
            ctx: RunContext::new(),
            event_loop: EventLoop::new(),
            conn: None,
            generation: 0,
            interrupted: false,
            captured: None,
            last_status: Instant::now(),
        })
    }

    /// Handle for requesting a graceful shutdown.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.event_loop.interrupt_handle()
    }

    /// Run context.
    #[must_use]
    pub const fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run statistics.
    #[must_use]
    pub const fn stats(&self) -> &RunStats {
        self.ctx.stats()
    }

    /// Active workload.
    #[must_use]
    pub const fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Runs until the cycle limit, an interrupt, a capture or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run; see [`DriverError::exit_code`].
    pub async fn run(&mut self) -> Result<Outcome, DriverError> {
        info!(
            workload = self.workload.name(),
            endpoint = %self.config.endpoint,
            batch_size = self.config.batch_size,
            cycles = ?self.config.cycles,
            "starting run"
        );

        let result = self.run_loop().await;
        self.event_loop.stop();

        match &result {
            Ok(outcome) => info!(?outcome, cycles = self.ctx.stats().cycles, "run finished"),
            Err(DriverError::Integrity {
                violation,
                artifact,
            }) => error!(
                %violation,
                artifact = ?artifact,
                "integrity violation"
            ),
            Err(e) => error!(error = %e, "run failed"),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<Outcome, DriverError> {
        self.connect()?;
        loop {
            match self.advance()? {
                Next::Finish(outcome) => return Ok(outcome),
                Next::Reconnect => {
                    let delay = self.config.reconnect_delay();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    self.connect()?;
                    continue;
                }
                Next::Wait => {}
            }

            let events = self
                .event_loop
                .run_once()
                .await
                .ok_or(DriverError::EventLoopClosed)?;
            for event in events {
                self.handle(event)?;
                if let Some(path) = self.captured.take() {
                    return Ok(Outcome::Captured { path });
                }
            }
            self.report_status();
        }
    }

    /// Moves the state machine forward as far as it can go without waiting.
    fn advance(&mut self) -> Result<Next, DriverError> {
        loop {
            match self.ctx.state() {
                RunState::Connecting => return Ok(Next::Wait),
                RunState::Uninitialized => {
                    if self.ctx.shutdown_requested() {
                        let outcome = if self.interrupted {
                            Outcome::Interrupted
                        } else {
                            Outcome::Completed
                        };
                        return Ok(Next::Finish(outcome));
                    }
                    return Ok(Next::Reconnect);
                }
                RunState::Draining => {
                    if !self.ctx.counters().all_zero() {
                        return Ok(Next::Wait);
                    }
                    self.disconnect()?;
                }
                RunState::Ready => {
                    if !self.ctx.counters().all_zero() {
                        return Ok(Next::Wait);
                    }
                    if self.ctx.batch_open() {
                        self.finish_batch();
                        if self.ctx.state() != RunState::Ready {
                            continue;
                        }
                    }
                    self.issue_batch();
                }
            }
        }
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        if self.generation > 0 {
            self.ctx.stats_mut().reconnects += 1;
        }
        self.generation += 1;

        let mut conn = self
            .connector
            .open(self.generation, self.event_loop.sender())?;
        conn.connect().map_err(DriverError::ConnectSubmit)?;
        self.conn = Some(conn);
        self.ctx.connecting();
        info!(generation = self.generation, endpoint = %self.config.endpoint, "connecting");
        Ok(())
    }

    /// Releases the drained connection.
    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.conn = None;
        self.ctx.set_state(RunState::Uninitialized);
        if self.ctx.batch_open() {
            self.ctx.close_batch();
            self.workload.on_abandoned();
        }
        info!(generation = self.generation, "disconnected");

        // An interrupt ends the run cleanly whatever started the drain.
        if !self.config.reconnect && !self.interrupted {
            match self.ctx.drain_cause() {
                Some(DrainCause::TransportFailure(message)) => {
                    return Err(DriverError::ConnectionLost {
                        message: message.clone(),
                    });
                }
                Some(DrainCause::SubmitFailure(e)) => return Err(DriverError::Submit(e.clone())),
                _ => {}
            }
        }
        Ok(())
    }

    fn finish_batch(&mut self) {
        self.ctx.close_batch();
        if !self.workload.on_batch_drained() {
            return;
        }

        let stats = self.ctx.stats_mut();
        stats.cycles += 1;
        let cycles = stats.cycles;
        debug!(cycles, "cycle complete");

        if self.config.cycles.is_some_and(|limit| cycles >= limit) {
            info!(cycles, "cycle limit reached");
            self.ctx.begin_drain(DrainCause::Completed);
        }
    }

    fn issue_batch(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        self.ctx.begin_batch();
        let mut sub = Submitter::new(conn, &mut self.ctx);
        let result = self.workload.on_ready(&mut sub);
        let submitted = sub.submitted();

        match result {
            Ok(()) if submitted == 0 => {
                warn!(workload = self.workload.name(), "workload issued nothing, stopping");
                self.ctx.close_batch();
                self.ctx.begin_drain(DrainCause::Completed);
            }
            Ok(()) => debug!(submitted, pending = %self.ctx.counters(), "batch issued"),
            Err(e) => {
                warn!(error = %e, submitted, "submission failed, abandoning batch");
                self.ctx.stats_mut().submit_failures += 1;
                self.ctx.begin_drain(DrainCause::SubmitFailure(e));
            }
        }
    }

    fn handle(&mut self, event: Event) -> Result<(), DriverError> {
        match event {
            Event::Configured { generation } => {
                if generation != self.generation {
                    debug!(generation, "ignoring stale configuration");
                    return Ok(());
                }
                self.ctx.connect_settled();
                if self.ctx.state() == RunState::Connecting {
                    info!(generation, "connected");
                    self.ctx.set_state(RunState::Ready);
                }
            }
            Event::TransportFailed {
                generation,
                message,
            } => {
                if generation != self.generation || self.conn.is_none() {
                    debug!(generation, %message, "ignoring stale transport error");
                    return Ok(());
                }
                warn!(generation, %message, "transport error");
                self.ctx.connect_settled();
                self.ctx.begin_drain(DrainCause::TransportFailure(message));
            }
            Event::Interrupt => {
                info!(pending = %self.ctx.counters(), "interrupt received");
                self.interrupted = true;
                self.ctx.begin_drain(DrainCause::Interrupt);
            }
            Event::Stored { token, result } => {
                let Some(entry) = self.ctx.complete(token, OpKind::Store, result.is_ok())? else {
                    return Ok(());
                };
                if let Err(e) = &result {
                    let key = entry.key.as_deref().unwrap_or_default();
                    if self.config.log_store_failures {
                        warn!(%key, error = %e, "store failed");
                    } else {
                        debug!(%key, error = %e, "store failed");
                    }
                }
                self.workload.on_store(&entry, &result);
            }
            Event::Fetched { token, result } => {
                let Some(entry) = self.ctx.complete(token, OpKind::Fetch, result.is_ok())? else {
                    return Ok(());
                };
                let key = entry.key.as_deref().unwrap_or_default();
                match result {
                    Ok(value) => {
                        if let Verdict::Captured(path) = self.workload.on_fetched(&entry, &value)? {
                            info!(%key, path = %path.display(), "value captured");
                            self.captured = Some(path);
                        }
                    }
                    Err(OpError::NotFound) => {
                        self.ctx.stats_mut().not_found += 1;
                        info!(%key, "key does not exist");
                    }
                    Err(e) => warn!(%key, error = %e, "fetch failed"),
                }
            }
            Event::Viewed { token, result } => {
                if self.ctx.complete(token, OpKind::View, result.is_ok())?.is_none() {
                    return Ok(());
                }
                self.workload.on_view(&result)?;
            }
        }
        Ok(())
    }

    fn report_status(&mut self) {
        let counters = self.ctx.counters();
        debug!(state = %self.ctx.state(), pending = %counters, "status");

        if self.last_status.elapsed() >= self.config.status_interval() {
            self.last_status = Instant::now();
            info!(
                state = %self.ctx.state(),
                conf = counters.get(OpKind::Connect),
                store = counters.get(OpKind::Store),
                fetch = counters.get(OpKind::Fetch),
                view = counters.get(OpKind::View),
                cycles = self.ctx.stats().cycles,
                "status"
            );
        }
    }
}
