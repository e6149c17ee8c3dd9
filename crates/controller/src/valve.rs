//! Valve actuation. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation tracks state in memory and logs
//! transitions.  The zone store only sees the `ValveDriver` trait.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Physical output a zone's open/close maps to.  `output` is the board
/// index resolved from the zone's attrs (GPIO pin or shift-register
/// channel).  Actuation may be genuinely slow, hence async.
#[async_trait]
pub trait ValveDriver: Send + Sync {
    async fn set(&self, output: u8, open: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioDriver {
    pins: Mutex<HashMap<u8, OutputPin>>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioDriver {
    pub fn new(outputs: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for pin_num in outputs {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "closed" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(*pin_num, pin);
        }

        Ok(Self {
            pins: Mutex::new(pins),
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
#[async_trait]
impl ValveDriver for GpioDriver {
    async fn set(&self, output: u8, open: bool) -> Result<()> {
        let mut pins = self
            .pins
            .lock()
            .map_err(|_| anyhow::anyhow!("gpio pin map poisoned"))?;
        let pin = pins
            .get_mut(&output)
            .ok_or_else(|| anyhow::anyhow!("no pin registered for output {output}"))?;
        // active-low relay: LOW = open, HIGH = closed
        if open == self.active_low {
            pin.set_low();
        } else {
            pin.set_high();
        }
        tracing::debug!(output, open, "gpio valve set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock driver (development — no hardware, tracks state in memory)
// ---------------------------------------------------------------------------
pub struct MockDriver {
    outputs: Mutex<HashMap<u8, bool>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of an output, for tests and the status page.
    pub fn is_open(&self, output: u8) -> bool {
        self.outputs
            .lock()
            .map(|o| o.get(&output).copied().unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValveDriver for MockDriver {
    async fn set(&self, output: u8, open: bool) -> Result<()> {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.insert(output, open);
        }
        tracing::debug!(output, open, "[mock] valve set");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_driver_starts_closed() {
        let driver = MockDriver::new();
        assert!(!driver.is_open(3));
    }

    #[tokio::test]
    async fn mock_driver_set_open_then_closed() {
        let driver = MockDriver::new();
        driver.set(3, true).await.unwrap();
        assert!(driver.is_open(3));
        driver.set(3, false).await.unwrap();
        assert!(!driver.is_open(3));
    }

    #[tokio::test]
    async fn mock_driver_outputs_are_independent() {
        let driver = MockDriver::new();
        driver.set(1, true).await.unwrap();
        assert!(driver.is_open(1));
        assert!(!driver.is_open(2));
    }
}
