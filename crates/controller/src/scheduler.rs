//! Minute-tick schedule evaluation.  On every minute boundary the scheduler
//! walks the enabled schedules in id order and dispatches the program of the
//! first one matching the current time.  At most one program runs at a time;
//! while one is active the evaluation pass is skipped entirely, so a second
//! schedule landing on the same minute simply loses the tie.

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Tick};
use crate::controller::ControllerHandle;
use crate::events::{Event, EventBus};
use crate::program::ProgramStore;
use crate::schedule::ScheduleStore;

pub struct Scheduler {
    schedules: ScheduleStore,
    programs: ProgramStore,
    controller: ControllerHandle,
    clock: Clock,
    bus: EventBus,
    /// Program id dispatched by us and not yet reported complete.
    running: Option<i64>,
}

impl Scheduler {
    pub fn new(
        schedules: ScheduleStore,
        programs: ProgramStore,
        controller: ControllerHandle,
        clock: Clock,
        bus: EventBus,
    ) -> Self {
        Self {
            schedules,
            programs,
            controller,
            clock,
            bus,
            running: None,
        }
    }

    /// Listen for minute ticks and program lifecycle events.  Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self) {
        info!("scheduler started");
        let mut ticks = self.clock.subscribe_min();
        let mut events = self.bus.subscribe();
        loop {
            tokio::select! {
                tick = ticks.recv() => match tick {
                    Ok(tick) => self.evaluate(tick).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "minute ticks lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(Event::ProgramCompleted { program_id, .. }) => {
                        self.on_completed(program_id).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "events lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("scheduler stopped");
    }

    /// One evaluation pass.  Public so tests can drive it with synthetic
    /// ticks instead of the wall clock.
    pub async fn evaluate(&mut self, tick: Tick) {
        if let Some(program_id) = self.running {
            debug!(program_id, "program running - skipping schedule check");
            return;
        }
        for schedule in self.schedules.all().await {
            if !schedule.enabled {
                continue;
            }
            if !schedule.matches(tick.now) {
                continue;
            }
            let Some(program) = self.programs.get(schedule.program_id).await else {
                error!(
                    schedule = schedule.id,
                    program = schedule.program_id,
                    "schedule references a missing program"
                );
                continue;
            };
            info!(
                schedule = schedule.id,
                name = %schedule.name,
                program = program.id,
                "schedule matched - running program"
            );
            self.running = Some(program.id);
            self.programs.set_running(program.id, true).await;
            self.controller.run_program(program).await;
            return;
        }
    }

    async fn on_completed(&mut self, program_id: i64) {
        match self.running {
            Some(expected) if expected == program_id => {
                debug!(program_id, "program completed");
                self.running = None;
                self.programs.set_running(program_id, false).await;
            }
            Some(expected) => {
                // Should not happen while only one program may run; clear
                // the flag anyway so the scheduler cannot wedge.
                error!(
                    expected,
                    completed = program_id,
                    "completed program does not match the running one"
                );
                self.running = None;
                self.programs.set_running(expected, false).await;
                self.programs.set_running(program_id, false).await;
            }
            None => {
                // Manually dispatched run; nothing of ours to clear.
                debug!(program_id, "untracked program completed");
                self.programs.set_running(program_id, false).await;
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
    use crate::controller::Command;
    use crate::db::ScheduleRecord;
    use crate::program::{Program, ProgramStep};
    use crate::schedule::ProgramSchedule;
    use chrono::{NaiveDate, NaiveDateTime};
    use tokio::sync::mpsc;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    fn weekly_schedule(id: i64, program_id: i64, dow_mask: i64, at_minute: i64) -> ProgramSchedule {
        ProgramSchedule::from_record(&ScheduleRecord {
            id,
            program_id,
            name: format!("schedule {id}"),
            schedule_type: "Weekly".into(),
            enabled: true,
            at_minute: Some(at_minute),
            dow_mask: Some(dow_mask),
            days_restriction: None,
            day_interval: None,
            minute_interval: None,
            on_day: None,
            start_day: None,
        })
        .unwrap()
    }

    fn test_program(id: i64) -> Program {
        Program::new(
            id,
            format!("program {id}"),
            "basic".into(),
            vec![ProgramStep::new(id * 10, id, 60, 1, vec![1])],
        )
    }

    async fn setup() -> (Scheduler, mpsc::Receiver<Command>, EventBus) {
        let bus = EventBus::new();
        let clock = Clock::new();
        let schedules = ScheduleStore::new(bus.clone());
        let programs = ProgramStore::new(bus.clone());
        let (handle, commands) = ControllerHandle::channel();
        let scheduler = Scheduler::new(schedules, programs, handle, clock, bus.clone());
        (scheduler, commands, bus)
    }

    fn dispatched(commands: &mut mpsc::Receiver<Command>) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Ok(cmd) = commands.try_recv() {
            if let Command::Run(program) = cmd {
                ids.push(program.id);
            }
        }
        ids
    }

    // 2021-06-01 is a Tuesday (dow 2, mask bit 0b0000100).

    #[tokio::test]
    async fn matching_schedule_dispatches_its_program() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        scheduler.schedules.add(weekly_schedule(1, 7, 0b0000100, 90)).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 30) }).await;
        assert_eq!(dispatched(&mut commands), vec![7]);
        assert!(scheduler.programs.is_running(7).await);
    }

    #[tokio::test]
    async fn non_matching_minute_dispatches_nothing() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        scheduler.schedules.add(weekly_schedule(1, 7, 0b0000100, 90)).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 31) }).await;
        assert!(dispatched(&mut commands).is_empty());
    }

    #[tokio::test]
    async fn disabled_schedule_is_ignored() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        let mut schedule = weekly_schedule(1, 7, 0b0000100, 90);
        schedule.enabled = false;
        scheduler.schedules.add(schedule).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 30) }).await;
        assert!(dispatched(&mut commands).is_empty());
    }

    #[tokio::test]
    async fn lowest_schedule_id_wins_the_tie() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        scheduler.programs.add(test_program(8)).await;
        scheduler.schedules.add(weekly_schedule(5, 8, 0b0000100, 90)).await;
        scheduler.schedules.add(weekly_schedule(2, 7, 0b0000100, 90)).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 30) }).await;
        assert_eq!(dispatched(&mut commands), vec![7]);
    }

    #[tokio::test]
    async fn no_dispatch_while_a_program_runs() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        scheduler.schedules.add(weekly_schedule(1, 7, 0b0000100, 90)).await;

        let tick = Tick { now: at(2021, 6, 1, 1, 30) };
        scheduler.evaluate(tick).await;
        scheduler.evaluate(tick).await;
        assert_eq!(dispatched(&mut commands), vec![7]);

        // Completion clears the gate; the next matching tick dispatches
        // again.
        scheduler.on_completed(7).await;
        assert!(!scheduler.programs.is_running(7).await);
        scheduler.evaluate(Tick { now: at(2021, 6, 8, 1, 30) }).await;
        assert_eq!(dispatched(&mut commands), vec![7]);
    }

    #[tokio::test]
    async fn missing_program_is_skipped_for_the_next_match() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(8)).await;
        // Schedule 1 points at a program that no longer exists.
        scheduler.schedules.add(weekly_schedule(1, 99, 0b0000100, 90)).await;
        scheduler.schedules.add(weekly_schedule(2, 8, 0b0000100, 90)).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 30) }).await;
        assert_eq!(dispatched(&mut commands), vec![8]);
    }

    #[tokio::test]
    async fn mismatched_completion_clears_the_gate() {
        let (mut scheduler, mut commands, _bus) = setup().await;
        scheduler.programs.add(test_program(7)).await;
        scheduler.schedules.add(weekly_schedule(1, 7, 0b0000100, 90)).await;

        scheduler.evaluate(Tick { now: at(2021, 6, 1, 1, 30) }).await;
        assert_eq!(dispatched(&mut commands), vec![7]);

        scheduler.on_completed(42).await;
        assert!(scheduler.running.is_none());
        assert!(!scheduler.programs.is_running(7).await);
    }
}
