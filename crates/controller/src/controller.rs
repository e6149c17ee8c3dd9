//! Program execution engine: the state machine that drives a program's
//! steps in sequence, coordinating master-zone (supply valve) opens and
//! closes with per-reference timing offsets.
//!
//! ## State machine
//!
//! ```text
//! Idle ──run──▶ StepActive(0) ──complete──▶ StepActive(1) ── ... ──▶ Complete ──▶ Idle
//! ```
//!
//! The controller runs as a single task owning all sequencing state, fed by
//! an mpsc command channel and, while a program is active, a second-tick
//! subscription.  Staggered master/zone opens and deferred master closes are
//! spawned as cancellable delayed actions keyed by zone id; scheduling a new
//! action for a zone cancels and replaces any pending one, so a stale action
//! can never fire after a more recent decision.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Tick};
use crate::events::{Event, EventBus};
use crate::program::{Program, ProgramStep};
use crate::zone::{MasterRef, ZoneStore};

const COMMAND_CAPACITY: usize = 8;

// ---------------------------------------------------------------------------
// Command channel
// ---------------------------------------------------------------------------

pub enum Command {
    Run(Program),
    Stop,
}

/// Cheap handle for sending fire-and-forget commands to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn channel() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn run_program(&self, program: Program) {
        if self.tx.send(Command::Run(program)).await.is_err() {
            error!("program controller is gone; dropping run request");
        }
    }

    pub async fn stop(&self) {
        if self.tx.send(Command::Stop).await.is_err() {
            error!("program controller is gone; dropping stop request");
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct ActiveRun {
    program: Program,
    step_idx: Option<usize>,
}

pub struct ProgramController {
    zones: ZoneStore,
    clock: Clock,
    bus: EventBus,
    current: Option<ActiveRun>,
    /// Held only while a program runs; at most one for the whole run.
    tick_rx: Option<broadcast::Receiver<Tick>>,
    /// Pending delayed open/close actions, keyed by target zone id.
    pending: HashMap<i64, JoinHandle<()>>,
}

impl ProgramController {
    pub fn new(zones: ZoneStore, clock: Clock, bus: EventBus) -> Self {
        Self {
            zones,
            clock,
            bus,
            current: None,
            tick_rx: None,
            pending: HashMap::new(),
        }
    }

    /// Command/tick loop.  Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("program controller started");
        loop {
            match self.tick_rx.take() {
                Some(mut rx) => {
                    tokio::select! {
                        cmd = commands.recv() => {
                            self.tick_rx = Some(rx);
                            match cmd {
                                Some(cmd) => self.handle_command(cmd).await,
                                None => break,
                            }
                        }
                        tick = rx.recv() => {
                            match tick {
                                Ok(_) => {
                                    self.tick_rx = Some(rx);
                                    self.check_progress().await;
                                }
                                Err(broadcast::error::RecvError::Lagged(missed)) => {
                                    warn!(missed, "second ticks lagged");
                                    self.tick_rx = Some(rx);
                                }
                                // Clock gone; fall back to commands only.
                                Err(broadcast::error::RecvError::Closed) => {}
                            }
                        }
                    }
                }
                None => match commands.recv().await {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }
        debug!("program controller stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Run(program) => {
                if let Some(run) = &self.current {
                    // Expected under normal polling cadence; the scheduler
                    // is the real gate.
                    debug!(
                        running = run.program.id,
                        requested = program.id,
                        "a program is already running; ignoring run request"
                    );
                    return;
                }
                self.run_program(program).await;
            }
            Command::Stop => self.stop(),
        }
    }

    // -- Lifecycle --------------------------------------------------------

    pub async fn run_program(&mut self, program: Program) {
        debug!(program = program.id, name = %program.name, "running program");
        self.bus.publish(Event::ProgramStarted {
            program_id: program.id,
            at: Utc::now(),
        });
        self.current = Some(ActiveRun {
            program,
            step_idx: None,
        });
        self.next_step().await;
    }

    /// Abort the running program: cancel every pending delayed action and
    /// return to idle.  Closing zones that are already open is left to the
    /// caller.
    pub fn stop(&mut self) {
        let Some(run) = self.current.take() else {
            debug!("stop requested with no program running");
            return;
        };
        warn!(program = run.program.id, "aborting running program");
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
        self.tick_rx = None;
        self.bus.publish(Event::ProgramCompleted {
            program_id: run.program.id,
            at: Utc::now(),
        });
    }

    fn program_complete(&mut self) {
        let Some(run) = self.current.take() else {
            return;
        };
        debug!(program = run.program.id, name = %run.program.name, "completed program");
        // Drop the tick subscription; pending master closes with a positive
        // close_offset are deliberately left to fire.
        self.tick_rx = None;
        self.bus.publish(Event::ProgramCompleted {
            program_id: run.program.id,
            at: Utc::now(),
        });
    }

    // -- Step sequencing --------------------------------------------------

    async fn next_step(&mut self) {
        let Some(run) = self.current.as_ref() else {
            return;
        };
        let next_idx = run.step_idx.map_or(0, |i| i + 1);
        if next_idx >= run.program.steps.len() {
            debug!("no next step - program complete");
            self.program_complete();
            return;
        }

        let step = run.program.steps[next_idx].clone();
        debug!(step = step.id, idx = next_idx, "starting next step");
        let lead = self.start_step(&step).await;

        if let Some(run) = self.current.as_mut() {
            run.program.steps[next_idx].start_with_lead(lead);
            run.step_idx = Some(next_idx);
        }
        // Idempotent: one live subscription for the whole program run.
        if self.tick_rx.is_none() {
            self.tick_rx = Some(self.clock.subscribe_sec());
        }
    }

    /// Open the step's master zones and target zones, staggered by the
    /// masters' open offsets.  Returns the lead time after which the target
    /// zones open (zero when no master needs a head start).
    async fn start_step(&mut self, step: &ProgramStep) -> Duration {
        if step.is_soak() {
            debug!(step = step.id, "no zones - soak step");
            return Duration::ZERO;
        }

        let masters = self.step_masters(step).await;
        let mut to_open = Vec::new();
        for master in masters {
            match self.zones.get(master.zone_id).await {
                Some(zone) if zone.is_open() => {
                    debug!(zone = master.zone_id, "master zone already open");
                }
                Some(_) => to_open.push(master),
                None => warn!(zone = master.zone_id, "step references a missing master zone"),
            }
        }

        let Some(first) = to_open.first().copied() else {
            debug!(step = step.id, "no master zones to open - opening zones");
            for zone_id in &step.zones {
                self.zones.open_zone(*zone_id).await;
            }
            return Duration::ZERO;
        };

        debug!(zone = first.zone_id, "opening first master zone");
        self.zones.open_zone(first.zone_id).await;
        for master in &to_open[1..] {
            let delay = (first.open_offset - master.open_offset).max(0) as u64;
            debug!(zone = master.zone_id, delay, "scheduling master zone open");
            self.schedule_action(master.zone_id, Duration::from_secs(delay), true);
        }

        let lead = Duration::from_secs(first.open_offset.max(0) as u64);
        if lead.is_zero() {
            for zone_id in &step.zones {
                self.zones.open_zone(*zone_id).await;
            }
        } else {
            debug!(step = step.id, lead = lead.as_secs(), "zones open after master lead");
            for zone_id in &step.zones {
                self.schedule_action(*zone_id, lead, true);
            }
        }
        lead
    }

    /// Per-second progress check while a program runs.
    pub async fn check_progress(&mut self) {
        let Some(run) = self.current.as_ref() else {
            return;
        };
        let Some(idx) = run.step_idx else {
            return;
        };
        let step = run.program.steps[idx].clone();
        debug!(step = step.id, "checking program progress");

        let masters = self.step_masters(&step).await;
        let next_masters = self.next_step_master_ids().await;

        // Masters whose offset exceeded the original lead: open them as
        // soon as their offset has elapsed and nothing is pending for them.
        if let Some(elapsed) = step.elapsed() {
            for master in &masters {
                if self.pending.contains_key(&master.zone_id) {
                    continue;
                }
                if elapsed < Duration::from_secs(master.open_offset.max(0) as u64) {
                    continue;
                }
                if let Some(zone) = self.zones.get(master.zone_id).await {
                    if !zone.is_open() && !step.is_complete() {
                        warn!(zone = master.zone_id, "master zone missed its open window - opening now");
                        self.zones.open_zone(master.zone_id).await;
                    }
                }
            }
        }

        // Pre-emptive drain closes: a master with a negative close_offset
        // that the next step does not need closes |close_offset| before the
        // current step ends.
        if let Some(remaining) = step.remaining() {
            for master in &masters {
                if master.close_offset >= 0 || next_masters.contains(&master.zone_id) {
                    continue;
                }
                if remaining > Duration::from_secs(master.close_offset.unsigned_abs()) {
                    continue;
                }
                if let Some(zone) = self.zones.get(master.zone_id).await {
                    if zone.is_open() {
                        debug!(zone = master.zone_id, "closing master zone early ahead of step change");
                        self.cancel_pending(master.zone_id);
                        self.zones.close_zone(master.zone_id).await;
                    }
                }
            }
        }

        if !step.is_complete() {
            debug!(step = step.id, "step not complete");
            return;
        }

        debug!(step = step.id, "step complete");
        if step.running {
            self.finish_step(&step, &masters, &next_masters).await;
        }
        if let Some(run) = self.current.as_mut() {
            run.program.steps[idx].end();
        }
        debug!(idx, "program step finished");
        self.next_step().await;
    }

    /// Close the finished step's zones, then any of its masters the next
    /// step does not need: immediately when `close_offset <= 0`, otherwise
    /// after the offset.
    async fn finish_step(
        &mut self,
        step: &ProgramStep,
        masters: &[MasterRef],
        next_masters: &HashSet<i64>,
    ) {
        for zone_id in &step.zones {
            self.cancel_pending(*zone_id);
            self.zones.close_zone(*zone_id).await;
        }
        for master in masters {
            if next_masters.contains(&master.zone_id) {
                debug!(
                    zone = master.zone_id,
                    "master zone will be used in next step - not closing"
                );
                continue;
            }
            let Some(zone) = self.zones.get(master.zone_id).await else {
                continue;
            };
            if !zone.is_open() {
                continue;
            }
            if master.close_offset <= 0 {
                debug!(zone = master.zone_id, "closing master zone now");
                self.cancel_pending(master.zone_id);
                self.zones.close_zone(master.zone_id).await;
            } else {
                debug!(
                    zone = master.zone_id,
                    delay = master.close_offset,
                    "scheduling master zone close"
                );
                self.schedule_action(
                    master.zone_id,
                    Duration::from_secs(master.close_offset as u64),
                    false,
                );
            }
        }
    }

    // -- Helpers ----------------------------------------------------------

    /// The step's distinct master zones, deduplicated across its target
    /// zones (largest open_offset wins when two zones share a master with
    /// different offsets), sorted by open_offset descending then zone id
    /// ascending for determinism.
    async fn step_masters(&self, step: &ProgramStep) -> Vec<MasterRef> {
        let mut by_id: HashMap<i64, MasterRef> = HashMap::new();
        for zone_id in &step.zones {
            let Some(zone) = self.zones.get(*zone_id).await else {
                warn!(zone = zone_id, "step references a missing zone");
                continue;
            };
            for master in &zone.masters {
                by_id
                    .entry(master.zone_id)
                    .and_modify(|existing| {
                        if master.open_offset > existing.open_offset {
                            *existing = *master;
                        }
                    })
                    .or_insert(*master);
            }
        }
        let mut masters: Vec<MasterRef> = by_id.into_values().collect();
        masters.sort_by(|a, b| {
            b.open_offset
                .cmp(&a.open_offset)
                .then(a.zone_id.cmp(&b.zone_id))
        });
        masters
    }

    fn get_next_step(&self) -> Option<ProgramStep> {
        let run = self.current.as_ref()?;
        let next_idx = run.step_idx? + 1;
        run.program.steps.get(next_idx).cloned()
    }

    async fn next_step_master_ids(&self) -> HashSet<i64> {
        match self.get_next_step() {
            Some(next) => self
                .step_masters(&next)
                .await
                .iter()
                .map(|m| m.zone_id)
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Schedule a delayed open/close for a zone, cancelling and replacing
    /// any action already pending for it.
    fn schedule_action(&mut self, zone_id: i64, delay: Duration, open: bool) {
        self.cancel_pending(zone_id);
        self.pending.retain(|_, handle| !handle.is_finished());

        let zones = self.zones.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if open {
                zones.open_zone(zone_id).await;
            } else {
                zones.close_zone(zone_id).await;
            }
        });
        self.pending.insert(zone_id, handle);
    }

    fn cancel_pending(&mut self, zone_id: i64) {
        if let Some(handle) = self.pending.remove(&zone_id) {
            if !handle.is_finished() {
                debug!(zone = zone_id, "cancelling pending zone action");
                handle.abort();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use crate::valve::ValveDriver;
    use crate::zone::{Zone, ZoneOutput, ZoneStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Driver that records every actuation with its virtual timestamp.
    struct RecordingDriver {
        log: Mutex<Vec<(Instant, u8, bool)>>,
    }

    impl RecordingDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
            })
        }

        fn log(&self) -> Vec<(Instant, u8, bool)> {
            self.log.lock().unwrap().clone()
        }

        fn opens(&self) -> Vec<u8> {
            self.log()
                .iter()
                .filter(|(_, _, on)| *on)
                .map(|(_, out, _)| *out)
                .collect()
        }
    }

    #[async_trait]
    impl ValveDriver for RecordingDriver {
        async fn set(&self, output: u8, open: bool) -> Result<()> {
            self.log.lock().unwrap().push((Instant::now(), output, open));
            Ok(())
        }
    }

    fn zone(id: i64, masters: Vec<MasterRef>) -> Zone {
        Zone::new(
            id,
            format!("Zone {id}"),
            "shift_register".into(),
            true,
            // output index doubles as the zone id for easy assertions
            ZoneOutput::ShiftRegister { channel: id as u8 },
            masters,
            None,
        )
    }

    fn master_ref(zone_id: i64, open_offset: i64, close_offset: i64) -> MasterRef {
        MasterRef {
            zone_id,
            open_offset,
            close_offset,
        }
    }

    fn program(steps: Vec<ProgramStep>) -> Program {
        Program::new(1, "test program".into(), "basic".into(), steps)
    }

    async fn setup(zones: Vec<Zone>) -> (ProgramController, Arc<RecordingDriver>, EventBus, Clock) {
        let driver = RecordingDriver::new();
        let bus = EventBus::new();
        let clock = Clock::new();
        let store = ZoneStore::new(driver.clone(), bus.clone());
        for z in zones {
            store.add(z).await;
        }
        let controller = ProgramController::new(store, clock.clone(), bus.clone());
        (controller, driver, bus, clock)
    }

    /// Advance virtual time by one second and run a progress check, like a
    /// clock tick would.
    async fn tick(controller: &mut ProgramController) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        controller.check_progress().await;
    }

    fn count_completions(rx: &mut broadcast::Receiver<Event>) -> usize {
        let mut n = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::ProgramCompleted { .. }) {
                n += 1;
            }
        }
        n
    }

    // -- Serial step execution -------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn three_steps_run_serially_with_one_completion() {
        let (mut controller, driver, bus, _clock) =
            setup(vec![zone(1, vec![]), zone(2, vec![]), zone(3, vec![])]).await;
        let mut events = bus.subscribe();

        controller
            .run_program(program(vec![
                ProgramStep::new(10, 1, 5, 1, vec![1]),
                ProgramStep::new(11, 1, 10, 2, vec![2]),
                ProgramStep::new(12, 1, 5, 3, vec![3]),
            ]))
            .await;

        // Zone 1 opens immediately; the others wait their turn.
        assert_eq!(driver.opens(), vec![1]);

        // Emulate real tick jitter so the sub-second-early completion rule
        // engages on the 4th tick of a 5 second step.
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..4 {
            tick(&mut controller).await;
        }
        // Step 1 completed one second early; step 2 started.
        assert!(driver.log().iter().any(|(_, out, on)| *out == 1 && !on));
        assert_eq!(driver.opens(), vec![1, 2]);
        assert_eq!(count_completions(&mut events), 0);

        for _ in 0..10 {
            tick(&mut controller).await;
        }
        assert_eq!(driver.opens(), vec![1, 2, 3]);
        assert_eq!(count_completions(&mut events), 0);

        for _ in 0..5 {
            tick(&mut controller).await;
        }
        assert_eq!(count_completions(&mut events), 1);

        // Controller returned to idle; further ticks change nothing.
        for _ in 0..5 {
            tick(&mut controller).await;
        }
        assert_eq!(count_completions(&mut events), 0);
        assert!(controller.current.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn soak_step_opens_no_zones() {
        let (mut controller, driver, bus, _clock) = setup(vec![zone(1, vec![])]).await;
        let mut events = bus.subscribe();

        controller
            .run_program(program(vec![
                ProgramStep::new(10, 1, 5, 1, vec![1]),
                ProgramStep::new(11, 1, 5, 2, vec![]), // soak
            ]))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..10 {
            tick(&mut controller).await;
        }
        assert_eq!(driver.opens(), vec![1]);
        assert_eq!(count_completions(&mut events), 1);
    }

    // -- Master-zone staggering ------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn masters_open_staggered_by_offset() {
        // M1 (id 11, offset 10) opens first, M2 (id 12, offset 4) six
        // seconds later, the zone itself after the full ten second lead.
        let (mut controller, driver, _bus, _clock) = setup(vec![
            zone(10, vec![master_ref(11, 10, 0), master_ref(12, 4, 0)]),
            zone(11, vec![]),
            zone(12, vec![]),
        ])
        .await;

        controller
            .run_program(program(vec![ProgramStep::new(20, 1, 30, 1, vec![10])]))
            .await;

        let log = driver.log();
        assert_eq!(log.len(), 1, "only the first master opens immediately");
        let (t0, out, on) = log[0];
        assert_eq!((out, on), (11, true));

        // Let the scheduled opens fire.
        tokio::time::sleep(Duration::from_secs(11)).await;

        let log = driver.log();
        let offsets: Vec<(u8, u64)> = log
            .iter()
            .map(|(t, out, _)| (*out, t.duration_since(t0).as_secs()))
            .collect();
        assert_eq!(offsets, vec![(11, 0), (12, 6), (10, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn already_open_master_is_not_rescheduled() {
        let (mut controller, driver, _bus, _clock) = setup(vec![
            zone(10, vec![master_ref(11, 10, 0)]),
            zone(11, vec![]),
        ])
        .await;
        controller.zones.open_zone(11).await;

        controller
            .run_program(program(vec![ProgramStep::new(20, 1, 30, 1, vec![10])]))
            .await;

        // No master to wait for: the zone opens immediately.
        let opens = driver.opens();
        assert_eq!(opens, vec![11, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_scheduled_opens() {
        let (controller, driver, bus, clock) = setup(vec![
            zone(10, vec![master_ref(11, 10, 0), master_ref(12, 4, 0)]),
            zone(11, vec![]),
            zone(12, vec![]),
        ])
        .await;
        let mut events = bus.subscribe();

        let (handle, commands) = ControllerHandle::channel();
        let task = tokio::spawn(controller.run(commands));

        handle
            .run_program(program(vec![ProgramStep::new(20, 1, 30, 1, vec![10])]))
            .await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Cancel before M2's open at t+6 and the zone open at t+10.
        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(driver.opens(), vec![11], "cancelled opens must never fire");
        assert_eq!(count_completions(&mut events), 1);
        assert_eq!(clock.sec_subscriber_count(), 0);

        task.abort();
    }

    // -- Master-zone closing ---------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn master_shared_with_next_step_stays_open() {
        let (mut controller, driver, bus, _clock) = setup(vec![
            zone(1, vec![master_ref(9, 0, 0)]),
            zone(2, vec![master_ref(9, 0, 0)]),
            zone(9, vec![]),
        ])
        .await;
        let mut events = bus.subscribe();

        controller
            .run_program(program(vec![
                ProgramStep::new(10, 1, 5, 1, vec![1]),
                ProgramStep::new(11, 1, 5, 2, vec![2]),
            ]))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..4 {
            tick(&mut controller).await;
        }
        // Step 1 finished: zone 1 closed, master 9 still open for step 2.
        let master_closes = driver
            .log()
            .iter()
            .filter(|(_, out, on)| *out == 9 && !on)
            .count();
        assert_eq!(master_closes, 0);
        assert!(controller.zones.get(9).await.unwrap().is_open());

        for _ in 0..5 {
            tick(&mut controller).await;
        }
        // Program done: master closed exactly once.
        let master_closes = driver
            .log()
            .iter()
            .filter(|(_, out, on)| *out == 9 && !on)
            .count();
        assert_eq!(master_closes, 1);
        assert_eq!(count_completions(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn positive_close_offset_defers_master_close() {
        let (mut controller, driver, _bus, _clock) = setup(vec![
            zone(1, vec![master_ref(9, 0, 7)]),
            zone(9, vec![]),
        ])
        .await;

        controller
            .run_program(program(vec![ProgramStep::new(10, 1, 5, 1, vec![1])]))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..4 {
            tick(&mut controller).await;
        }
        // Program complete, but the master close is deferred 7 seconds.
        assert!(controller.current.is_none());
        assert!(controller.zones.get(9).await.unwrap().is_open());

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert!(!controller.zones.get(9).await.unwrap().is_open());
        let _ = driver;
    }

    #[tokio::test(start_paused = true)]
    async fn negative_close_offset_closes_master_early() {
        let (mut controller, _driver, _bus, _clock) = setup(vec![
            zone(1, vec![master_ref(9, 0, -3)]),
            zone(9, vec![]),
        ])
        .await;

        controller
            .run_program(program(vec![ProgramStep::new(10, 1, 10, 1, vec![1])]))
            .await;
        assert!(controller.zones.get(9).await.unwrap().is_open());

        tokio::time::sleep(Duration::from_millis(10)).await;
        // At 6 ticks, remaining ~4s > 3s: master still open.
        for _ in 0..6 {
            tick(&mut controller).await;
        }
        assert!(controller.zones.get(9).await.unwrap().is_open());

        // At 7 ticks, remaining ~3s <= 3s: drain close fires while the
        // dependent zone keeps running.
        tick(&mut controller).await;
        assert!(!controller.zones.get(9).await.unwrap().is_open());
        assert!(controller.zones.get(1).await.unwrap().is_open());
    }

    // -- Robustness -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn missing_zone_reference_is_skipped() {
        let (mut controller, driver, bus, _clock) = setup(vec![zone(1, vec![])]).await;
        let mut events = bus.subscribe();

        controller
            .run_program(program(vec![ProgramStep::new(10, 1, 5, 1, vec![1, 999])]))
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            tick(&mut controller).await;
        }
        assert_eq!(driver.opens(), vec![1]);
        assert_eq!(count_completions(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_subscription_is_created_once_per_run() {
        let (mut controller, _driver, _bus, clock) =
            setup(vec![zone(1, vec![]), zone(2, vec![]), zone(3, vec![])]).await;

        controller
            .run_program(program(vec![
                ProgramStep::new(10, 1, 5, 1, vec![1]),
                ProgramStep::new(11, 1, 5, 2, vec![2]),
                ProgramStep::new(12, 1, 5, 3, vec![3]),
            ]))
            .await;
        assert_eq!(clock.sec_subscriber_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..9 {
            tick(&mut controller).await;
            assert!(clock.sec_subscriber_count() <= 1);
        }
        // Mid-run, across step transitions, still exactly one.
        assert_eq!(clock.sec_subscriber_count(), 1);

        for _ in 0..5 {
            tick(&mut controller).await;
        }
        // Completed: subscription dropped.
        assert_eq!(clock.sec_subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_zone_replaces_pending_action() {
        let (mut controller, driver, _bus, _clock) = setup(vec![zone(5, vec![])]).await;

        controller.schedule_action(5, Duration::from_secs(10), true);
        controller.schedule_action(5, Duration::from_secs(2), false);
        assert_eq!(controller.pending.len(), 1);

        tokio::time::sleep(Duration::from_secs(15)).await;
        // Only the replacement fired; the original open was cancelled.
        let log = driver.log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].1, log[0].2), (5, false));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_program_completes_immediately() {
        let (mut controller, _driver, bus, clock) = setup(vec![]).await;
        let mut events = bus.subscribe();

        controller.run_program(program(vec![])).await;
        assert!(controller.current.is_none());
        assert_eq!(count_completions(&mut events), 1);
        assert_eq!(clock.sec_subscriber_count(), 0);
    }
}
