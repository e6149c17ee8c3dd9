//! Typed event bus.  State changes are broadcast to whoever is listening
//! (scheduler, web status task); publishing with no subscribers is a no-op.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Channel capacity.  Slow subscribers see a `Lagged` error and catch up
/// rather than back-pressuring publishers.
const BUS_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub enum Event {
    ProgramStarted { program_id: i64, at: DateTime<Utc> },
    ProgramCompleted { program_id: i64, at: DateTime<Utc> },
    ZoneState { zone_id: i64, open: bool },
    ProgramState { program_id: i64 },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Deliver an event to all current subscribers.
    pub fn publish(&self, event: Event) {
        // Err here just means nobody is subscribed.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
