use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::events::{Event, EventBus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub zones: HashMap<i64, ZoneState>,
    pub running_program: Option<RunningProgram>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct ZoneState {
    pub name: String,
    pub open: bool,
    pub last_changed: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize)]
pub struct RunningProgram {
    pub program_id: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    Program,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub zones: HashMap<i64, ZoneState>,
    pub running_program: Option<RunningProgram>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(zone_names: &[(i64, String)]) -> Self {
        let mut zones = HashMap::new();
        for (id, name) in zone_names {
            zones.insert(
                *id,
                ZoneState {
                    name: name.clone(),
                    open: false,
                    last_changed: None,
                },
            );
        }

        Self {
            started_at: Instant::now(),
            zones,
            running_program: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a valve state change.
    pub fn record_valve(&mut self, zone_id: i64, open: bool) {
        if let Some(zone) = self.zones.get_mut(&zone_id) {
            zone.open = open;
            zone.last_changed = Some(Utc::now());
        }

        let state_str = if open { "OPEN" } else { "CLOSED" };
        self.push_event(EventKind::Valve, format!("zone {zone_id} set {state_str}"));
    }

    pub fn record_program_started(&mut self, program_id: i64, at: DateTime<Utc>) {
        self.running_program = Some(RunningProgram {
            program_id,
            started_at: at,
        });
        self.push_event(EventKind::Program, format!("program {program_id} started"));
    }

    pub fn record_program_completed(&mut self, program_id: i64) {
        self.running_program = None;
        self.push_event(EventKind::Program, format!("program {program_id} completed"));
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            zones: self.zones.clone(),
            running_program: self.running_program.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Bus mirror task
// ---------------------------------------------------------------------------

/// Mirror bus events into the shared state the web API serves from.
/// Intended to be `tokio::spawn`-ed from main.
pub async fn watch(state: SharedState, bus: EventBus) {
    let mut rx = bus.subscribe();
    loop {
        match rx.recv().await {
            Ok(Event::ZoneState { zone_id, open }) => {
                state.write().await.record_valve(zone_id, open);
            }
            Ok(Event::ProgramStarted { program_id, at }) => {
                state.write().await.record_program_started(program_id, at);
            }
            Ok(Event::ProgramCompleted { program_id, .. }) => {
                state.write().await.record_program_completed(program_id);
            }
            Ok(Event::ProgramState { .. }) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "state watcher lagged behind the event bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_zone() -> SystemState {
        SystemState::new(&[(1, "Front bed".into())])
    }

    #[test]
    fn record_valve_updates_zone_and_events() {
        let mut state = state_with_zone();
        state.record_valve(1, true);

        assert!(state.zones[&1].open);
        assert!(state.zones[&1].last_changed.is_some());
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn record_valve_for_unknown_zone_still_logs() {
        let mut state = state_with_zone();
        state.record_valve(42, true);
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn program_lifecycle_sets_and_clears_running() {
        let mut state = state_with_zone();
        state.record_program_started(7, Utc::now());
        assert_eq!(state.running_program.as_ref().unwrap().program_id, 7);

        state.record_program_completed(7);
        assert!(state.running_program.is_none());
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut state = state_with_zone();
        for i in 0..(MAX_EVENTS + 50) {
            state.record_system(format!("event {i}"));
        }
        assert_eq!(state.events.len(), MAX_EVENTS);
        // Newest-first in the status snapshot.
        let status = state.to_status();
        assert_eq!(status.events[0].detail, format!("event {}", MAX_EVENTS + 49));
    }

    #[tokio::test]
    async fn watch_mirrors_bus_events() {
        let bus = EventBus::new();
        let state: SharedState = Arc::new(RwLock::new(state_with_zone()));
        let task = tokio::spawn(watch(state.clone(), bus.clone()));

        // Give the watcher a chance to subscribe before publishing.
        tokio::task::yield_now().await;
        bus.publish(Event::ZoneState {
            zone_id: 1,
            open: true,
        });
        bus.publish(Event::ProgramStarted {
            program_id: 3,
            at: Utc::now(),
        });

        // Wait for the events to land.
        for _ in 0..100 {
            if state.read().await.running_program.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let snapshot = state.read().await;
        assert!(snapshot.zones[&1].open);
        assert_eq!(snapshot.running_program.as_ref().unwrap().program_id, 3);

        drop(snapshot);
        task.abort();
    }
}
