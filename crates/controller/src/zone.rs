//! Zone model and store.  A zone is a controllable valve output with an
//! optional ordered list of master-zone references (upstream supply valves
//! with independent open/close timing offsets).  Zone types are resolved
//! through a registry mapping the type tag to an attrs parser, so new
//! hardware bindings register at startup without touching the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::db::ZoneRecord;
use crate::errors::ZoneError;
use crate::events::{Event, EventBus};
use crate::valve::ValveDriver;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Reference from a dependent zone to an upstream master zone.
/// `open_offset` (>= 0) is the lead time the master needs before the
/// dependent zone opens; `close_offset` controls when the master may close
/// relative to its dependents finishing (<= 0 means "close immediately
/// when safe", negative magnitude allows a pre-emptive drain close).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterRef {
    pub zone_id: i64,
    pub open_offset: i64,
    pub close_offset: i64,
}

/// Informational record of a zone's most recent run.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ZoneRun {
    pub start: DateTime<Utc>,
    pub duration: i64,
}

/// Hardware binding resolved from a zone's attrs by the type registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneOutput {
    Gpio { pin: u8 },
    ShiftRegister { channel: u8 },
}

impl ZoneOutput {
    /// Board index handed to the valve driver.
    pub fn index(&self) -> u8 {
        match self {
            ZoneOutput::Gpio { pin } => *pin,
            ZoneOutput::ShiftRegister { channel } => *channel,
        }
    }
}

#[derive(Debug)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub zone_type: String,
    pub active: bool,
    pub output: ZoneOutput,
    /// Immutable after load; edits go through the CRUD path and a reload.
    pub masters: Vec<MasterRef>,
    pub last_run: Option<ZoneRun>,
    open: AtomicBool,
}

impl Zone {
    pub fn new(
        id: i64,
        name: String,
        zone_type: String,
        active: bool,
        output: ZoneOutput,
        masters: Vec<MasterRef>,
        last_run: Option<ZoneRun>,
    ) -> Self {
        Self {
            id,
            name,
            zone_type,
            active,
            output,
            masters,
            last_run,
            open: AtomicBool::new(false),
        }
    }

    /// Build a zone from its persisted record, validating the attrs payload
    /// against the type registry.
    pub fn from_record(
        rec: &ZoneRecord,
        masters: Vec<MasterRef>,
        last_run: Option<ZoneRun>,
        registry: &ZoneRegistry,
    ) -> Result<Self, ZoneError> {
        let attrs: serde_json::Value =
            serde_json::from_str(&rec.attrs).map_err(|e| ZoneError::InvalidAttrs {
                kind: rec.zone_type.clone(),
                reason: e.to_string(),
            })?;
        let output = registry.parse_attrs(&rec.zone_type, &attrs)?;
        Ok(Self::new(
            rec.id,
            rec.name.clone(),
            rec.zone_type.clone(),
            rec.active,
            output,
            masters,
            last_run,
        ))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Type registry
// ---------------------------------------------------------------------------

pub type AttrsParser = fn(&serde_json::Value) -> Result<ZoneOutput, ZoneError>;

/// Maps a zone-type tag to the parser validating that type's attrs payload.
pub struct ZoneRegistry {
    parsers: HashMap<&'static str, AttrsParser>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the built-in zone types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("gpio", parse_gpio_attrs);
        registry.register("shift_register", parse_shift_register_attrs);
        registry
    }

    pub fn register(&mut self, tag: &'static str, parser: AttrsParser) {
        self.parsers.insert(tag, parser);
    }

    pub fn parse_attrs(
        &self,
        zone_type: &str,
        attrs: &serde_json::Value,
    ) -> Result<ZoneOutput, ZoneError> {
        match self.parsers.get(zone_type) {
            Some(parser) => parser(attrs),
            None => Err(ZoneError::UnknownType(zone_type.to_string())),
        }
    }
}

impl Default for ZoneRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn attr_u8(attrs: &serde_json::Value, kind: &str, field: &str) -> Result<u8, ZoneError> {
    let invalid = |reason: String| ZoneError::InvalidAttrs {
        kind: kind.to_string(),
        reason,
    };
    let value = attrs
        .get(field)
        .ok_or_else(|| invalid(format!("missing '{field}'")))?;
    value
        .as_u64()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| invalid(format!("'{field}' must be an integer in 0..=255")))
}

fn parse_gpio_attrs(attrs: &serde_json::Value) -> Result<ZoneOutput, ZoneError> {
    Ok(ZoneOutput::Gpio {
        pin: attr_u8(attrs, "gpio", "pin")?,
    })
}

fn parse_shift_register_attrs(attrs: &serde_json::Value) -> Result<ZoneOutput, ZoneError> {
    Ok(ZoneOutput::ShiftRegister {
        channel: attr_u8(attrs, "shift_register", "channel")?,
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory zone store: the single source of truth for zone state while
/// the controller runs.  The controller assumes exclusive access to zone
/// open/closed state during a program run (caller contract).
#[derive(Clone)]
pub struct ZoneStore {
    zones: Arc<RwLock<BTreeMap<i64, Arc<Zone>>>>,
    driver: Arc<dyn ValveDriver>,
    bus: EventBus,
}

impl ZoneStore {
    pub fn new(driver: Arc<dyn ValveDriver>, bus: EventBus) -> Self {
        Self {
            zones: Arc::new(RwLock::new(BTreeMap::new())),
            driver,
            bus,
        }
    }

    pub async fn add(&self, zone: Zone) {
        let id = zone.id;
        self.zones.write().await.insert(id, Arc::new(zone));
        self.bus.publish(Event::ZoneState {
            zone_id: id,
            open: false,
        });
    }

    pub async fn get(&self, id: i64) -> Option<Arc<Zone>> {
        self.zones.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: i64) -> Option<Arc<Zone>> {
        self.zones.write().await.remove(&id)
    }

    /// All zones in id order.
    pub async fn all(&self) -> Vec<Arc<Zone>> {
        self.zones.read().await.values().cloned().collect()
    }

    /// Open a zone's valve.  A missing zone is logged and skipped (it may
    /// have been deleted mid-run); a driver failure is logged and absorbed —
    /// step progression is timer-driven and must not hang on hardware.
    pub async fn open_zone(&self, id: i64) {
        let Some(zone) = self.get(id).await else {
            warn!(zone = id, "requested to open a non-existent zone");
            return;
        };
        if let Err(e) = self.driver.set(zone.output.index(), true).await {
            error!(zone = id, "failed to open zone: {e:#}");
            return;
        }
        zone.set_open(true);
        debug!(zone = id, "opened zone");
        self.bus.publish(Event::ZoneState {
            zone_id: id,
            open: true,
        });
    }

    /// Close a zone's valve.  Same failure policy as `open_zone`.
    pub async fn close_zone(&self, id: i64) {
        let Some(zone) = self.get(id).await else {
            warn!(zone = id, "requested to close a non-existent zone");
            return;
        };
        if let Err(e) = self.driver.set(zone.output.index(), false).await {
            error!(zone = id, "failed to close zone: {e:#}");
            return;
        }
        zone.set_open(false);
        debug!(zone = id, "closed zone");
        self.bus.publish(Event::ZoneState {
            zone_id: id,
            open: false,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valve::MockDriver;
    use serde_json::json;

    fn test_zone(id: i64, channel: u8) -> Zone {
        Zone::new(
            id,
            format!("Zone {id}"),
            "shift_register".into(),
            true,
            ZoneOutput::ShiftRegister { channel },
            vec![],
            None,
        )
    }

    // -- Registry ---------------------------------------------------------

    #[test]
    fn registry_parses_gpio_attrs() {
        let registry = ZoneRegistry::with_builtin();
        let output = registry.parse_attrs("gpio", &json!({"pin": 17})).unwrap();
        assert_eq!(output, ZoneOutput::Gpio { pin: 17 });
    }

    #[test]
    fn registry_parses_shift_register_attrs() {
        let registry = ZoneRegistry::with_builtin();
        let output = registry
            .parse_attrs("shift_register", &json!({"channel": 3}))
            .unwrap();
        assert_eq!(output, ZoneOutput::ShiftRegister { channel: 3 });
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = ZoneRegistry::with_builtin();
        assert!(matches!(
            registry.parse_attrs("sprinkler_9000", &json!({})),
            Err(ZoneError::UnknownType(_))
        ));
    }

    #[test]
    fn registry_rejects_missing_attr() {
        let registry = ZoneRegistry::with_builtin();
        assert!(matches!(
            registry.parse_attrs("gpio", &json!({})),
            Err(ZoneError::InvalidAttrs { .. })
        ));
    }

    #[test]
    fn registry_rejects_out_of_range_attr() {
        let registry = ZoneRegistry::with_builtin();
        assert!(registry.parse_attrs("gpio", &json!({"pin": 300})).is_err());
        assert!(registry.parse_attrs("gpio", &json!({"pin": -1})).is_err());
    }

    // -- Store ------------------------------------------------------------

    #[tokio::test]
    async fn open_and_close_flip_zone_state() {
        let driver = Arc::new(MockDriver::new());
        let store = ZoneStore::new(driver.clone(), EventBus::new());
        store.add(test_zone(1, 4)).await;

        store.open_zone(1).await;
        assert!(store.get(1).await.unwrap().is_open());
        assert!(driver.is_open(4));

        store.close_zone(1).await;
        assert!(!store.get(1).await.unwrap().is_open());
        assert!(!driver.is_open(4));
    }

    #[tokio::test]
    async fn open_publishes_zone_state_event() {
        let bus = EventBus::new();
        let store = ZoneStore::new(Arc::new(MockDriver::new()), bus.clone());
        store.add(test_zone(1, 0)).await;

        let mut rx = bus.subscribe();
        store.open_zone(1).await;

        match rx.recv().await.unwrap() {
            Event::ZoneState { zone_id, open } => {
                assert_eq!(zone_id, 1);
                assert!(open);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn open_missing_zone_does_not_panic() {
        let store = ZoneStore::new(Arc::new(MockDriver::new()), EventBus::new());
        store.open_zone(999).await;
        store.close_zone(999).await;
    }

    #[tokio::test]
    async fn all_returns_zones_in_id_order() {
        let store = ZoneStore::new(Arc::new(MockDriver::new()), EventBus::new());
        store.add(test_zone(5, 0)).await;
        store.add(test_zone(2, 1)).await;
        store.add(test_zone(9, 2)).await;

        let ids: Vec<i64> = store.all().await.iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn from_record_validates_attrs() {
        let registry = ZoneRegistry::with_builtin();
        let rec = ZoneRecord {
            id: 1,
            name: "Front bed".into(),
            zone_type: "gpio".into(),
            active: true,
            attrs: r#"{"pin": 17}"#.into(),
        };
        let zone = Zone::from_record(&rec, vec![], None, &registry).unwrap();
        assert_eq!(zone.output, ZoneOutput::Gpio { pin: 17 });

        let bad = ZoneRecord {
            attrs: r#"{"pin": "seventeen"}"#.into(),
            ..rec
        };
        assert!(Zone::from_record(&bad, vec![], None, &registry).is_err());
    }
}
