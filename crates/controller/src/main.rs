mod clock;
mod config;
mod controller;
mod db;
mod errors;
mod events;
mod program;
mod schedule;
mod scheduler;
mod state;
mod valve;
mod web;
mod zone;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::Clock;
use controller::{ControllerHandle, ProgramController};
use db::Db;
use events::EventBus;
use program::{ProgramRegistry, ProgramStore};
use schedule::{ProgramSchedule, ScheduleStore};
use scheduler::Scheduler;
use state::SystemState;
use valve::ValveDriver;
use zone::{Zone, ZoneRegistry, ZoneStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Registries ──────────────────────────────────────────────────
    let zone_registry = ZoneRegistry::with_builtin();
    let program_registry = ProgramRegistry::with_builtin();

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed zones + programs + schedules) ─────────────
    if std::path::Path::new(&config_path).exists() {
        let cfg = config::load(&config_path, &zone_registry)?;
        config::apply(&cfg, &db).await?;
    } else {
        warn!("config file {config_path} not found; using database contents as-is");
    }

    // ── Valve driver ────────────────────────────────────────────────
    let driver = build_driver()?;

    // ── Core plumbing ───────────────────────────────────────────────
    let bus = EventBus::new();
    let clock = Clock::new();
    let zones = ZoneStore::new(driver, bus.clone());
    let programs = ProgramStore::new(bus.clone());
    let schedules = ScheduleStore::new(bus.clone());

    // Load everything from the DB — it is the source of truth.
    let zone_records = db.load_zones().await?;
    if zone_records.is_empty() {
        warn!("no zones configured in the database");
    }
    let mut zone_names = Vec::with_capacity(zone_records.len());
    for rec in &zone_records {
        let masters = db.load_masters(rec.id).await?;
        let last_run = db.last_run(rec.id).await?;
        match Zone::from_record(rec, masters, last_run, &zone_registry) {
            Ok(zone) => {
                zone_names.push((zone.id, zone.name.clone()));
                zones.add(zone).await;
            }
            Err(e) => error!(zone = rec.id, "skipping invalid zone: {e}"),
        }
    }

    for rec in db.load_programs().await? {
        let steps = db
            .load_steps(rec.id)
            .await?
            .into_iter()
            .map(|s| program::ProgramStep::new(s.id, s.program_id, s.duration, s.ord, s.zones))
            .collect();
        match program_registry.build(&rec, steps) {
            Ok(program) => programs.add(program).await,
            Err(e) => error!(program = rec.id, "skipping invalid program: {e}"),
        }
    }

    for rec in db.load_schedules().await? {
        match ProgramSchedule::from_record(&rec) {
            Ok(schedule) => schedules.add(schedule).await,
            Err(e) => error!(schedule = rec.id, "skipping invalid schedule: {e}"),
        }
    }

    info!(
        zones = zone_names.len(),
        "controller ready — {} program(s), {} schedule(s)",
        programs.all().await.len(),
        schedules.all().await.len()
    );

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = Arc::new(RwLock::new(SystemState::new(&zone_names)));
    shared
        .write()
        .await
        .record_system("controller started".to_string());
    tokio::spawn(state::watch(shared.clone(), bus.clone()));

    // ── Tasks ───────────────────────────────────────────────────────
    let (handle, commands) = ControllerHandle::channel();
    let program_controller = ProgramController::new(zones.clone(), clock.clone(), bus.clone());
    tokio::spawn(program_controller.run(commands));
    tokio::spawn(
        Scheduler::new(
            schedules.clone(),
            programs.clone(),
            handle.clone(),
            clock.clone(),
            bus.clone(),
        )
        .run(),
    );
    tokio::spawn(clock.clone().run());
    tokio::spawn(web::serve(shared));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.stop().await;
    for zone in zones.all().await {
        if zone.is_open() {
            zones.close_zone(zone.id).await;
        }
    }

    Ok(())
}

fn build_driver() -> Result<Arc<dyn ValveDriver>> {
    #[cfg(feature = "gpio")]
    {
        // Many common relay boards are active-low. If yours is active-high,
        // set RELAY_ACTIVE_LOW=0.
        let active_low = env::var("RELAY_ACTIVE_LOW")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let pins: Vec<u8> = (2..=27).collect();
        Ok(Arc::new(valve::GpioDriver::new(&pins, active_low)?))
    }
    #[cfg(not(feature = "gpio"))]
    {
        info!("gpio feature disabled; using mock valve driver");
        Ok(Arc::new(valve::MockDriver::new()))
    }
}
