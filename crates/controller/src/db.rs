//! SQLite persistence.  The database is the durable home of zones,
//! programs, schedules, and the zone run log; the stores in `zone`,
//! `program`, and `schedule` hold the hydrated in-memory working set.
//!
//! Runtime query API throughout (no compile-time checked macros) so the
//! crate builds without a database present.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::zone::{MasterRef, ZoneRun};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct ZoneRecord {
    pub id: i64,
    pub name: String,
    pub zone_type: String,
    pub active: bool,
    /// JSON payload interpreted by the zone-type registry.
    pub attrs: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProgramRecord {
    pub id: i64,
    pub name: String,
    pub program_type: String,
}

/// A program step row plus its zones (loaded from `step_zones`).
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: i64,
    pub program_id: i64,
    pub duration: i64,
    pub ord: i64,
    pub zones: Vec<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRecord {
    pub id: i64,
    pub program_id: i64,
    pub name: String,
    pub schedule_type: String,
    pub enabled: bool,
    pub at_minute: Option<i64>,
    pub dow_mask: Option<i64>,
    pub days_restriction: Option<String>,
    pub day_interval: Option<i64>,
    pub minute_interval: Option<i64>,
    pub on_day: Option<chrono::NaiveDate>,
    pub start_day: Option<chrono::NaiveDate>,
}

#[derive(FromRow)]
struct StepRow {
    id: i64,
    program_id: i64,
    duration: i64,
    ord: i64,
}

#[derive(FromRow)]
struct MasterRow {
    master_id: i64,
    open_offset: i64,
    close_offset: i64,
}

#[derive(FromRow)]
struct ZoneRunRow {
    start: DateTime<Utc>,
    duration: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:irrigation.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zones
    // ----------------------------

    pub async fn upsert_zone(&self, z: &ZoneRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (id, name, zone_type, active, attrs)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              zone_type=excluded.zone_type,
              active=excluded.active,
              attrs=excluded.attrs
            "#,
        )
        .bind(z.id)
        .bind(&z.name)
        .bind(&z.zone_type)
        .bind(z.active)
        .bind(&z.attrs)
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<ZoneRecord>> {
        sqlx::query_as::<_, ZoneRecord>(
            "SELECT id, name, zone_type, active, attrs FROM zones ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zones failed")
    }

    pub async fn delete_zone(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM zones WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_zone failed")?;
        Ok(())
    }

    /// Replace a zone's master-zone edges wholesale.
    pub async fn replace_masters(&self, zone_id: i64, masters: &[MasterRef]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        sqlx::query("DELETE FROM master_zones WHERE zone_id = ?")
            .bind(zone_id)
            .execute(&mut *tx)
            .await
            .context("clear masters failed")?;
        for m in masters {
            sqlx::query(
                r#"
                INSERT INTO master_zones (zone_id, master_id, open_offset, close_offset)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(zone_id)
            .bind(m.zone_id)
            .bind(m.open_offset)
            .bind(m.close_offset)
            .execute(&mut *tx)
            .await
            .context("insert master failed")?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    pub async fn load_masters(&self, zone_id: i64) -> Result<Vec<MasterRef>> {
        let rows = sqlx::query_as::<_, MasterRow>(
            r#"
            SELECT master_id, open_offset, close_offset
            FROM master_zones
            WHERE zone_id = ?
            ORDER BY master_id
            "#,
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await
        .context("load_masters failed")?;
        Ok(rows
            .into_iter()
            .map(|r| MasterRef {
                zone_id: r.master_id,
                open_offset: r.open_offset,
                close_offset: r.close_offset,
            })
            .collect())
    }

    // ----------------------------
    // Programs and steps
    // ----------------------------

    pub async fn upsert_program(&self, p: &ProgramRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO programs (id, name, program_type)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              program_type=excluded.program_type
            "#,
        )
        .bind(p.id)
        .bind(&p.name)
        .bind(&p.program_type)
        .execute(&self.pool)
        .await
        .context("upsert_program failed")?;
        Ok(())
    }

    pub async fn load_programs(&self) -> Result<Vec<ProgramRecord>> {
        sqlx::query_as::<_, ProgramRecord>(
            "SELECT id, name, program_type FROM programs ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_programs failed")
    }

    pub async fn delete_program(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM programs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_program failed")?;
        Ok(())
    }

    pub async fn upsert_step(&self, s: &StepRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        sqlx::query(
            r#"
            INSERT INTO steps (id, program_id, duration, ord)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              program_id=excluded.program_id,
              duration=excluded.duration,
              ord=excluded.ord
            "#,
        )
        .bind(s.id)
        .bind(s.program_id)
        .bind(s.duration)
        .bind(s.ord)
        .execute(&mut *tx)
        .await
        .context("upsert_step failed")?;
        sqlx::query("DELETE FROM step_zones WHERE step_id = ?")
            .bind(s.id)
            .execute(&mut *tx)
            .await
            .context("clear step zones failed")?;
        for zone_id in &s.zones {
            sqlx::query("INSERT INTO step_zones (step_id, zone_id) VALUES (?, ?)")
                .bind(s.id)
                .bind(zone_id)
                .execute(&mut *tx)
                .await
                .context("insert step zone failed")?;
        }
        tx.commit().await.context("commit failed")?;
        Ok(())
    }

    /// A program's steps in (ord, id) order, each with its zone list.
    pub async fn load_steps(&self, program_id: i64) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, program_id, duration, ord
            FROM steps
            WHERE program_id = ?
            ORDER BY ord, id
            "#,
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await
        .context("load_steps failed")?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let zones: Vec<(i64,)> = sqlx::query_as(
                "SELECT zone_id FROM step_zones WHERE step_id = ? ORDER BY zone_id",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await
            .context("load step zones failed")?;
            steps.push(StepRecord {
                id: row.id,
                program_id: row.program_id,
                duration: row.duration,
                ord: row.ord,
                zones: zones.into_iter().map(|(id,)| id).collect(),
            });
        }
        Ok(steps)
    }

    // ----------------------------
    // Schedules
    // ----------------------------

    pub async fn upsert_schedule(&self, s: &ScheduleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedules (
              id, program_id, name, schedule_type, enabled,
              at_minute, dow_mask, days_restriction,
              day_interval, minute_interval, on_day, start_day
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              program_id=excluded.program_id,
              name=excluded.name,
              schedule_type=excluded.schedule_type,
              enabled=excluded.enabled,
              at_minute=excluded.at_minute,
              dow_mask=excluded.dow_mask,
              days_restriction=excluded.days_restriction,
              day_interval=excluded.day_interval,
              minute_interval=excluded.minute_interval,
              on_day=excluded.on_day,
              start_day=excluded.start_day
            "#,
        )
        .bind(s.id)
        .bind(s.program_id)
        .bind(&s.name)
        .bind(&s.schedule_type)
        .bind(s.enabled)
        .bind(s.at_minute)
        .bind(s.dow_mask)
        .bind(&s.days_restriction)
        .bind(s.day_interval)
        .bind(s.minute_interval)
        .bind(s.on_day)
        .bind(s.start_day)
        .execute(&self.pool)
        .await
        .context("upsert_schedule failed")?;
        Ok(())
    }

    pub async fn load_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        sqlx::query_as::<_, ScheduleRecord>(
            r#"
            SELECT id, program_id, name, schedule_type, enabled,
                   at_minute, dow_mask, days_restriction,
                   day_interval, minute_interval, on_day, start_day
            FROM schedules
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_schedules failed")
    }

    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_schedule failed")?;
        Ok(())
    }

    // ----------------------------
    // Run log
    // ----------------------------

    pub async fn record_zone_run(&self, zone_id: i64, run: &ZoneRun) -> Result<()> {
        sqlx::query("INSERT INTO zone_runs (zone_id, start, duration) VALUES (?, ?, ?)")
            .bind(zone_id)
            .bind(run.start)
            .bind(run.duration)
            .execute(&self.pool)
            .await
            .context("record_zone_run failed")?;
        Ok(())
    }

    pub async fn last_run(&self, zone_id: i64) -> Result<Option<ZoneRun>> {
        let row = sqlx::query_as::<_, ZoneRunRow>(
            r#"
            SELECT start, duration
            FROM zone_runs
            WHERE zone_id = ?
            ORDER BY start DESC
            LIMIT 1
            "#,
        )
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .context("last_run failed")?;
        Ok(row.map(|r| ZoneRun {
            start: r.start,
            duration: r.duration,
        }))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
