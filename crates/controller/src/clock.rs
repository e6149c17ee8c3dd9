//! Global clock: broadcasts a tick every second, aligned to wall-clock
//! whole seconds, and a coarser tick on every minute boundary
//! (`now.second() == 0`).  All time-based polling in the system hangs off
//! these two channels.

use chrono::{NaiveDateTime, Timelike};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

const TICK_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct Tick {
    pub now: NaiveDateTime,
}

#[derive(Clone)]
pub struct Clock {
    sec: broadcast::Sender<Tick>,
    min: broadcast::Sender<Tick>,
}

impl Clock {
    pub fn new() -> Self {
        let (sec, _) = broadcast::channel(TICK_CAPACITY);
        let (min, _) = broadcast::channel(TICK_CAPACITY);
        Self { sec, min }
    }

    pub fn subscribe_sec(&self) -> broadcast::Receiver<Tick> {
        self.sec.subscribe()
    }

    pub fn subscribe_min(&self) -> broadcast::Receiver<Tick> {
        self.min.subscribe()
    }

    /// Number of live second-tick subscriptions.
    pub fn sec_subscriber_count(&self) -> usize {
        self.sec.receiver_count()
    }

    /// Emit one tick.  Split out from `run` so tests can drive the clock
    /// with synthetic timestamps.
    pub fn tick(&self, now: NaiveDateTime) {
        let _ = self.sec.send(Tick { now });
        if now.second() == 0 {
            let _ = self.min.send(Tick { now });
        }
    }

    /// Tick loop.  Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self) {
        loop {
            let now = chrono::Local::now();
            // Sleep to the next whole second so minute ticks land close to
            // second zero of the minute.
            let subsec = now.timestamp_subsec_millis().min(999) as u64;
            sleep(Duration::from_millis(1000 - subsec)).await;
            self.tick(chrono::Local::now().naive_local());
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
