//! Schedule model and matching.  A schedule binds one program to a
//! declarative time rule, evaluated once per minute tick.  Matching is a
//! pure function of the schedule and a timestamp.
//!
//! The minute tick's exact firing second may jitter, so a match is only
//! valid within the first `MATCH_WINDOW_SEC` seconds of the target minute.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::ScheduleRecord;
use crate::errors::ScheduleError;
use crate::events::{Event, EventBus};

/// Seconds into the target minute during which a match is still valid.
pub const MATCH_WINDOW_SEC: u32 = 5;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaysRestriction {
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalRepeat {
    /// Re-run every n days at the scheduled minute.
    Days(i64),
    /// Re-run every n minutes, all day; the `at` minute only anchors the
    /// interval's phase.
    Minutes(i64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    Weekly {
        /// Bit i = day i, 0 = Sunday (`0000001` Sun, `0000010` Mon, ...).
        dow_mask: u8,
        days_restriction: Option<DaysRestriction>,
    },
    Interval {
        start_day: NaiveDate,
        repeat: IntervalRepeat,
    },
    Single {
        on_day: NaiveDate,
    },
}

#[derive(Clone, Debug)]
pub struct ProgramSchedule {
    pub id: i64,
    pub program_id: i64,
    pub name: String,
    pub enabled: bool,
    /// Minute of day, 0-1439.
    pub at: u32,
    pub kind: ScheduleKind,
}

impl ProgramSchedule {
    /// Build a schedule from its persisted record.  Exactly one of the
    /// three shapes must be populated; anything else is rejected here,
    /// never silently defaulted.
    pub fn from_record(rec: &ScheduleRecord) -> Result<Self, ScheduleError> {
        let invalid = |reason: &str| ScheduleError::InvalidDefinition(reason.to_string());

        let at = rec
            .at_minute
            .ok_or_else(|| invalid("'at' minute-of-day is required"))?;
        if !(0..=1439).contains(&at) {
            return Err(invalid("'at' must be in 0..=1439"));
        }

        let kind = match rec.schedule_type.as_str() {
            "Weekly" => {
                if rec.day_interval.is_some() || rec.minute_interval.is_some() {
                    return Err(invalid("weekly schedule cannot carry interval fields"));
                }
                if rec.on_day.is_some() || rec.start_day.is_some() {
                    return Err(invalid("weekly schedule cannot carry date fields"));
                }
                let mask = rec
                    .dow_mask
                    .ok_or_else(|| invalid("weekly schedule requires dow_mask"))?;
                if !(1..=0x7f).contains(&mask) {
                    return Err(invalid("dow_mask must set at least one of seven day bits"));
                }
                let days_restriction = match rec.days_restriction.as_deref() {
                    None | Some("") => None,
                    Some("E") => Some(DaysRestriction::Even),
                    Some("O") => Some(DaysRestriction::Odd),
                    Some(other) => {
                        return Err(ScheduleError::InvalidDefinition(format!(
                            "days_restriction must be 'E' or 'O', got '{other}'"
                        )))
                    }
                };
                ScheduleKind::Weekly {
                    dow_mask: mask as u8,
                    days_restriction,
                }
            }
            "Interval" => {
                if rec.dow_mask.is_some() || rec.days_restriction.is_some() {
                    return Err(invalid("interval schedule cannot carry weekly fields"));
                }
                if rec.on_day.is_some() {
                    return Err(invalid("interval schedule cannot carry on_day"));
                }
                let start_day = rec
                    .start_day
                    .ok_or_else(|| invalid("interval schedule requires start_day"))?;
                let repeat = match (rec.day_interval, rec.minute_interval) {
                    (Some(d), None) if d > 0 => IntervalRepeat::Days(d),
                    (None, Some(m)) if m > 0 => IntervalRepeat::Minutes(m),
                    (Some(_), Some(_)) => {
                        return Err(invalid(
                            "day_interval and minute_interval are mutually exclusive",
                        ))
                    }
                    _ => {
                        return Err(invalid(
                            "interval schedule requires a positive day_interval or minute_interval",
                        ))
                    }
                };
                ScheduleKind::Interval { start_day, repeat }
            }
            "Single" => {
                if rec.dow_mask.is_some()
                    || rec.days_restriction.is_some()
                    || rec.day_interval.is_some()
                    || rec.minute_interval.is_some()
                    || rec.start_day.is_some()
                {
                    return Err(invalid("single schedule cannot carry other shape fields"));
                }
                let on_day = rec
                    .on_day
                    .ok_or_else(|| invalid("single schedule requires on_day"))?;
                ScheduleKind::Single { on_day }
            }
            other => {
                return Err(ScheduleError::InvalidDefinition(format!(
                    "unknown schedule type '{other}'"
                )))
            }
        };

        Ok(Self {
            id: rec.id,
            program_id: rec.program_id,
            name: rec.name.clone(),
            enabled: rec.enabled,
            at: at as u32,
            kind,
        })
    }

    // -- Matching ---------------------------------------------------------

    /// Does this schedule fire at `now`?  Pure; no side effects.
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        match &self.kind {
            ScheduleKind::Weekly {
                dow_mask,
                days_restriction,
            } => self.matches_weekly(now, *dow_mask, *days_restriction),
            ScheduleKind::Interval { start_day, repeat } => {
                self.matches_interval(now, *start_day, *repeat)
            }
            ScheduleKind::Single { on_day } => self.matches_single(now, *on_day),
        }
    }

    fn minute_matches(&self, now: NaiveDateTime) -> bool {
        let minute_of_day = now.hour() * 60 + now.minute();
        minute_of_day == self.at && now.second() < MATCH_WINDOW_SEC
    }

    fn matches_weekly(
        &self,
        now: NaiveDateTime,
        dow_mask: u8,
        days_restriction: Option<DaysRestriction>,
    ) -> bool {
        // 0 = Sunday, matching the mask convention.
        let dow = now.weekday().num_days_from_sunday();
        let dow_ok = (1u8 << dow) & dow_mask != 0;

        let restriction_ok = match days_restriction {
            None => true,
            Some(DaysRestriction::Even) => now.day() % 2 == 0,
            Some(DaysRestriction::Odd) => now.day() % 2 == 1,
        };

        dow_ok && self.minute_matches(now) && restriction_ok
    }

    fn matches_interval(
        &self,
        now: NaiveDateTime,
        start_day: NaiveDate,
        repeat: IntervalRepeat,
    ) -> bool {
        // `at` is validated to 0..=1439, so this is always a valid time.
        let Some(anchor) = start_day.and_hms_opt(self.at / 60, self.at % 60, 0) else {
            return false;
        };
        let elapsed = now - anchor;
        match repeat {
            IntervalRepeat::Days(n) => {
                self.minute_matches(now) && elapsed.num_days().rem_euclid(n) == 0
            }
            IntervalRepeat::Minutes(n) => {
                elapsed.num_minutes().rem_euclid(n) == 0
                    && elapsed.num_seconds().rem_euclid(60) < MATCH_WINDOW_SEC as i64
            }
        }
    }

    fn matches_single(&self, now: NaiveDateTime, on_day: NaiveDate) -> bool {
        // Known limitation carried over from deployed behavior: only the
        // day-of-month is compared, so the schedule re-fires in a later
        // month if it is not disabled after running.
        now.day() == on_day.day() && self.minute_matches(now)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Schedules keyed by id; iteration order (id ascending) is the scheduler's
/// documented tie-break when several schedules match the same minute.
#[derive(Clone)]
pub struct ScheduleStore {
    schedules: Arc<RwLock<BTreeMap<i64, ProgramSchedule>>>,
    bus: EventBus,
}

impl ScheduleStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            schedules: Arc::new(RwLock::new(BTreeMap::new())),
            bus,
        }
    }

    pub async fn add(&self, schedule: ProgramSchedule) {
        let program_id = schedule.program_id;
        self.schedules
            .write()
            .await
            .insert(schedule.id, schedule);
        self.bus.publish(Event::ProgramState { program_id });
    }

    pub async fn get(&self, id: i64) -> Option<ProgramSchedule> {
        self.schedules.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: i64) -> Option<ProgramSchedule> {
        let removed = self.schedules.write().await.remove(&id);
        if let Some(s) = &removed {
            self.bus.publish(Event::ProgramState {
                program_id: s.program_id,
            });
        }
        removed
    }

    /// All schedules in id order.
    pub async fn all(&self) -> Vec<ProgramSchedule> {
        self.schedules.read().await.values().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
