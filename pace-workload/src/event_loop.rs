//! Completion queue driving the controller.
//!
//! Transports post [`Event`]s from their I/O tasks; the controller is the
//! only consumer. [`EventLoop::run_once`] is the single point at which the
//! controller yields to the runtime.

use tokio::sync::mpsc;

use crate::connection::{post, Event, EventSender};

/// Single-consumer completion queue.
#[derive(Debug)]
pub struct EventLoop {
    tx: EventSender,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sender handed to connections.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Handle that requests a graceful shutdown from any task.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            tx: self.tx.clone(),
        }
    }

    /// Waits for at least one event, then drains everything already queued.
    ///
    /// Returns `None` once the queue has been stopped and emptied.
    pub async fn run_once(&mut self) -> Option<Vec<Event>> {
        let first = self.rx.recv().await?;
        let mut events = vec![first];
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        Some(events)
    }

    /// Drains whatever is queued without waiting.
    pub fn run_until_idle(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Stops accepting events. Already queued events can still be drained.
    pub fn stop(&mut self) {
        self.rx.close();
    }
}

/// Requests a graceful shutdown.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: EventSender,
}

impl InterruptHandle {
    /// Posts an interrupt. No-op once the loop has stopped.
    pub fn interrupt(&self) {
        post(&self.tx, Event::Interrupt);
    }
}
