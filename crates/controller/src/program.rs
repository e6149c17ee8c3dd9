//! Program and step model.  A program is an ordered list of serial steps;
//! each step runs one or more zones concurrently for a fixed duration.
//! Step completion is timer-based: a step is considered complete once less
//! than one second of its duration remains, an artifact of integer-second
//! tick granularity that deployed duration semantics depend on.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::db::ProgramRecord;
use crate::errors::ProgramError;
use crate::events::{Event, EventBus};

/// Completion fires when less than this much of a step remains.  The same
/// constant applies to steps and delayed actions; do not change it without
/// revisiting duration semantics.
pub const COMPLETION_TOLERANCE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ProgramStep {
    pub id: i64,
    pub program_id: i64,
    /// Seconds; always > 0.
    pub duration: i64,
    /// Serial position; steps iterate by ascending order, ties by id.
    pub order: i64,
    /// Target zone ids.  Empty = soak step (pure wait).
    pub zones: Vec<i64>,

    pub running: bool,
    pub done: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    run_until: Option<Instant>,
}

impl ProgramStep {
    pub fn new(id: i64, program_id: i64, duration: i64, order: i64, zones: Vec<i64>) -> Self {
        Self {
            id,
            program_id,
            duration,
            order,
            zones,
            running: false,
            done: false,
            started_at: None,
            completed_at: None,
            started: None,
            run_until: None,
        }
    }

    pub fn is_soak(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn start(&mut self) {
        self.start_with_lead(Duration::ZERO);
    }

    /// Start the step.  `lead` is the master-zone lead time before the
    /// target zones open; the duration clock runs from when the zones open,
    /// so `run_until = now + lead + duration`.
    pub fn start_with_lead(&mut self, lead: Duration) {
        let now = Instant::now();
        self.running = true;
        self.started_at = Some(Utc::now());
        self.started = Some(now);
        self.run_until = Some(now + lead + Duration::from_secs(self.duration.max(0) as u64));
    }

    pub fn end(&mut self) {
        self.running = false;
        self.done = true;
        self.completed_at = Some(Utc::now());
    }

    /// Completion rule: `(run_until - now) < 1s`, i.e. a step completes up
    /// to just under one second early.
    pub fn is_complete(&self) -> bool {
        if self.done {
            return true;
        }
        match self.run_until {
            Some(until) => until.saturating_duration_since(Instant::now()) < COMPLETION_TOLERANCE,
            None => false,
        }
    }

    /// Time since the step was started (master opens are offset from this).
    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    /// Time until the step's scheduled end, saturating at zero.
    pub fn remaining(&self) -> Option<Duration> {
        self.run_until
            .map(|until| until.saturating_duration_since(Instant::now()))
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Program {
    pub id: i64,
    pub name: String,
    pub program_type: String,
    /// Sorted by (order, id) at construction; iteration is always in this
    /// order.
    pub steps: Vec<ProgramStep>,
}

impl Program {
    pub fn new(id: i64, name: String, program_type: String, mut steps: Vec<ProgramStep>) -> Self {
        steps.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
        Self {
            id,
            name,
            program_type,
            steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Type registry
// ---------------------------------------------------------------------------

pub type ProgramBuilder = fn(&ProgramRecord, Vec<ProgramStep>) -> Program;

/// Maps a program-type tag to its constructor.  New program types register
/// at startup; the store and controller only see `Program`.
pub struct ProgramRegistry {
    builders: HashMap<&'static str, ProgramBuilder>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("basic", |rec, steps| {
            Program::new(rec.id, rec.name.clone(), rec.program_type.clone(), steps)
        });
        registry
    }

    pub fn register(&mut self, tag: &'static str, builder: ProgramBuilder) {
        self.builders.insert(tag, builder);
    }

    pub fn build(
        &self,
        rec: &ProgramRecord,
        steps: Vec<ProgramStep>,
    ) -> Result<Program, ProgramError> {
        match self.builders.get(rec.program_type.as_str()) {
            Some(builder) => Ok(builder(rec, steps)),
            None => Err(ProgramError::UnknownType(rec.program_type.clone())),
        }
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct StoredProgram {
    program: Program,
    is_running: bool,
}

/// Programs keyed by id.  `is_running` is true only while the controller
/// has the program as its current program.
#[derive(Clone)]
pub struct ProgramStore {
    programs: Arc<RwLock<BTreeMap<i64, StoredProgram>>>,
    bus: EventBus,
}

impl ProgramStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            programs: Arc::new(RwLock::new(BTreeMap::new())),
            bus,
        }
    }

    pub async fn add(&self, program: Program) {
        let id = program.id;
        self.programs.write().await.insert(
            id,
            StoredProgram {
                program,
                is_running: false,
            },
        );
        self.bus.publish(Event::ProgramState { program_id: id });
    }

    pub async fn get(&self, id: i64) -> Option<Program> {
        self.programs
            .read()
            .await
            .get(&id)
            .map(|p| p.program.clone())
    }

    pub async fn remove(&self, id: i64) -> Option<Program> {
        let removed = self.programs.write().await.remove(&id);
        if removed.is_some() {
            self.bus.publish(Event::ProgramState { program_id: id });
        }
        removed.map(|p| p.program)
    }

    /// All programs in id order.
    pub async fn all(&self) -> Vec<Program> {
        self.programs
            .read()
            .await
            .values()
            .map(|p| p.program.clone())
            .collect()
    }

    pub async fn is_running(&self, id: i64) -> bool {
        self.programs
            .read()
            .await
            .get(&id)
            .map(|p| p.is_running)
            .unwrap_or(false)
    }

    pub async fn set_running(&self, id: i64, running: bool) {
        if let Some(stored) = self.programs.write().await.get_mut(&id) {
            stored.is_running = running;
        }
        self.bus.publish(Event::ProgramState { program_id: id });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
