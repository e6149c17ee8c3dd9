//! TOML config file loading, validation, and database seeding for zones,
//! programs, and schedules.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::{Db, ProgramRecord, ScheduleRecord, StepRecord, ZoneRecord};
use crate::schedule::ProgramSchedule;
use crate::zone::{MasterRef, ZoneRegistry};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub id: i64,
    pub name: String,
    pub zone_type: String,
    #[serde(default = "default_attrs")]
    pub attrs: toml::Value,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub masters: Vec<MasterEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MasterEntry {
    pub zone_id: i64,
    #[serde(default)]
    pub open_offset: i64,
    #[serde(default)]
    pub close_offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProgramEntry {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_program_type")]
    pub program_type: String,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StepEntry {
    pub id: i64,
    pub duration: i64,
    pub order: i64,
    /// Empty means a soak step (timed pause, nothing opens).
    #[serde(default)]
    pub zones: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub program_id: i64,
    pub name: String,
    pub schedule_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub at_minute: Option<i64>,
    pub dow_mask: Option<i64>,
    pub days_restriction: Option<String>,
    pub day_interval: Option<i64>,
    pub minute_interval: Option<i64>,
    /// "YYYY-MM-DD"
    pub on_day: Option<String>,
    pub start_day: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_attrs() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

fn default_program_type() -> String {
    "basic".into()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self, registry: &ZoneRegistry) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_zones(registry, &mut errors);
        self.validate_programs(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, registry: &ZoneRegistry, errors: &mut Vec<String>) {
        let zone_ids: HashSet<i64> = self.zones.iter().map(|z| z.id).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.id > 0 {
                    format!("zone {}", z.id)
                } else {
                    format!("zones[{i}]")
                }
            };

            if z.id <= 0 {
                errors.push(format!("{}: id must be positive", ctx()));
            } else if !seen_ids.insert(z.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            match attrs_to_json(&z.attrs) {
                Ok(attrs) => {
                    if let Err(e) = registry.parse_attrs(&z.zone_type, &attrs) {
                        errors.push(format!("{}: {e}", ctx()));
                    }
                }
                Err(e) => errors.push(format!("{}: attrs are not valid: {e}", ctx())),
            }

            let mut seen_masters: HashSet<i64> = HashSet::new();
            for m in &z.masters {
                if m.zone_id == z.id {
                    errors.push(format!("{}: lists itself as a master zone", ctx()));
                } else if !zone_ids.contains(&m.zone_id) {
                    errors.push(format!(
                        "{}: master zone {} does not match any defined zone",
                        ctx(),
                        m.zone_id
                    ));
                }
                if !seen_masters.insert(m.zone_id) {
                    errors.push(format!(
                        "{}: master zone {} listed more than once",
                        ctx(),
                        m.zone_id
                    ));
                }
                if m.open_offset < 0 {
                    errors.push(format!(
                        "{}: master zone {} open_offset must be >= 0, got {}",
                        ctx(),
                        m.zone_id,
                        m.open_offset
                    ));
                }
            }
        }
    }

    fn validate_programs(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<i64> = self.zones.iter().map(|z| z.id).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();
        let mut seen_step_ids: HashSet<i64> = HashSet::new();

        for (i, p) in self.programs.iter().enumerate() {
            let ctx = || {
                if p.id > 0 {
                    format!("program {}", p.id)
                } else {
                    format!("programs[{i}]")
                }
            };

            if p.id <= 0 {
                errors.push(format!("{}: id must be positive", ctx()));
            } else if !seen_ids.insert(p.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            for s in &p.steps {
                if !seen_step_ids.insert(s.id) {
                    errors.push(format!("{}: duplicate step id {}", ctx(), s.id));
                }
                if s.duration <= 0 {
                    errors.push(format!(
                        "{}: step {} duration must be positive, got {}",
                        ctx(),
                        s.id,
                        s.duration
                    ));
                }
                for zone_id in &s.zones {
                    if !zone_ids.contains(zone_id) {
                        errors.push(format!(
                            "{}: step {} zone {} does not match any defined zone",
                            ctx(),
                            s.id,
                            zone_id
                        ));
                    }
                }
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let program_ids: HashSet<i64> = self.programs.iter().map(|p| p.id).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.id > 0 {
                    format!("schedule {}", s.id)
                } else {
                    format!("schedules[{i}]")
                }
            };

            if s.id <= 0 {
                errors.push(format!("{}: id must be positive", ctx()));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }

            if !program_ids.contains(&s.program_id) {
                errors.push(format!(
                    "{}: program {} does not match any defined program",
                    ctx(),
                    s.program_id
                ));
            }

            // Shape validation lives with the schedule model; run the real
            // constructor so config and database rows are held to the same
            // rules.
            match s.to_record() {
                Ok(rec) => {
                    if let Err(e) = ProgramSchedule::from_record(&rec) {
                        errors.push(format!("{}: {e}", ctx()));
                    }
                }
                Err(e) => errors.push(format!("{}: {e}", ctx())),
            }
        }
    }
}

impl ScheduleEntry {
    fn to_record(&self) -> Result<ScheduleRecord> {
        Ok(ScheduleRecord {
            id: self.id,
            program_id: self.program_id,
            name: self.name.clone(),
            schedule_type: self.schedule_type.clone(),
            enabled: self.enabled,
            at_minute: self.at_minute,
            dow_mask: self.dow_mask,
            days_restriction: self.days_restriction.clone(),
            day_interval: self.day_interval,
            minute_interval: self.minute_interval,
            on_day: parse_date(self.on_day.as_deref(), "on_day")?,
            start_day: parse_date(self.start_day.as_deref(), "start_day")?,
        })
    }
}

fn parse_date(value: Option<&str>, field: &str) -> Result<Option<NaiveDate>> {
    match value {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .with_context(|| format!("{field} '{s}' is not a YYYY-MM-DD date")),
    }
}

fn attrs_to_json(attrs: &toml::Value) -> Result<serde_json::Value> {
    serde_json::to_value(attrs).context("attrs do not convert to JSON")
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str, registry: &ZoneRegistry) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate(registry)
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all zones, programs, and schedules from the config into the
/// database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for z in &config.zones {
        let attrs = attrs_to_json(&z.attrs)?;
        db.upsert_zone(&ZoneRecord {
            id: z.id,
            name: z.name.clone(),
            zone_type: z.zone_type.clone(),
            active: z.active,
            attrs: attrs.to_string(),
        })
        .await
        .with_context(|| format!("failed to upsert zone {}", z.id))?;

        let masters: Vec<MasterRef> = z
            .masters
            .iter()
            .map(|m| MasterRef {
                zone_id: m.zone_id,
                open_offset: m.open_offset,
                close_offset: m.close_offset,
            })
            .collect();
        db.replace_masters(z.id, &masters)
            .await
            .with_context(|| format!("failed to set masters for zone {}", z.id))?;
    }

    for p in &config.programs {
        db.upsert_program(&ProgramRecord {
            id: p.id,
            name: p.name.clone(),
            program_type: p.program_type.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert program {}", p.id))?;

        for s in &p.steps {
            db.upsert_step(&StepRecord {
                id: s.id,
                program_id: p.id,
                duration: s.duration,
                ord: s.order,
                zones: s.zones.clone(),
            })
            .await
            .with_context(|| format!("failed to upsert step {} of program {}", s.id, p.id))?;
        }
    }

    for s in &config.schedules {
        let rec = s.to_record()?;
        db.upsert_schedule(&rec)
            .await
            .with_context(|| format!("failed to upsert schedule {}", s.id))?;
    }

    tracing::info!(
        zones = config.zones.len(),
        programs = config.programs.len(),
        schedules = config.schedules.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
