//! Pump relay, grow light and flow sensor input.  The `gpio` feature gates
//! the real rppal drivers; without it, mock outputs log state changes and
//! flow pulses come from the simulator.

use anyhow::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

use hydro_core::{LightOutput, Relay};

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
#[cfg(feature = "gpio")]
use std::sync::{Arc, Mutex};

#[cfg(feature = "gpio")]
use hydro_core::{Clock, PulseCounter};

#[cfg(not(feature = "gpio"))]
use std::sync::atomic::AtomicBool;

/// Software PWM carrier for the grow light driver.
#[cfg(feature = "gpio")]
const LIGHT_PWM_HZ: f64 = 500.0;

// ---------------------------------------------------------------------------
// Real GPIO (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct RelayBoard {
    pin: Mutex<OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        let mut pin = gpio
            .get(pin_num)
            .with_context(|| format!("relay gpio {pin_num} unavailable"))?
            .into_output();

        // Fail-safe: ensure "OFF" at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(gpio = pin_num, active_low, "relay ready (OFF)");

        Ok(Self {
            pin: Mutex::new(pin),
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl Relay for RelayBoard {
    fn set(&self, on: bool) {
        let mut pin = match self.pin.lock() {
            Ok(pin) => pin,
            Err(poisoned) => poisoned.into_inner(),
        };
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(pump = if on { "ON" } else { "OFF" }, "relay set");
    }
}

#[cfg(feature = "gpio")]
pub struct GrowLight {
    pin: Mutex<OutputPin>,
    level: AtomicU8,
}

#[cfg(feature = "gpio")]
impl GrowLight {
    pub fn new(pin_num: u8) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open GPIO")?;
        let mut pin = gpio
            .get(pin_num)
            .with_context(|| format!("light gpio {pin_num} unavailable"))?
            .into_output();
        pin.set_low();
        info!(gpio = pin_num, "grow light ready (0)");
        Ok(Self {
            pin: Mutex::new(pin),
            level: AtomicU8::new(0),
        })
    }
}

#[cfg(feature = "gpio")]
impl LightOutput for GrowLight {
    fn set_brightness(&self, brightness: u8) {
        let mut pin = match self.pin.lock() {
            Ok(pin) => pin,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = match brightness {
            0 | 255 => pin.clear_pwm(),
            level => pin.set_pwm_frequency(LIGHT_PWM_HZ, f64::from(level) / 255.0),
        };
        match brightness {
            0 => pin.set_low(),
            255 => pin.set_high(),
            _ => {}
        }
        if let Err(e) = result {
            tracing::error!(brightness, "grow light pwm failed: {e}");
            return;
        }
        let previous = self.level.swap(brightness, Ordering::Relaxed);
        info!(previous, brightness, "grow light set");
    }
}

/// Count falling edges on the flow sensor pin.  The returned pin must be
/// kept alive for the interrupt to stay armed.
#[cfg(feature = "gpio")]
pub fn attach_flow_sensor(
    pin_num: u8,
    counter: Arc<PulseCounter>,
    clock: Arc<dyn Clock>,
) -> Result<InputPin> {
    let gpio = Gpio::new().context("failed to open GPIO")?;
    let mut pin = gpio
        .get(pin_num)
        .with_context(|| format!("flow sensor gpio {pin_num} unavailable"))?
        .into_input_pullup();
    pin.set_async_interrupt(Trigger::FallingEdge, move |_: Level| {
        counter.on_interrupt(clock.now());
    })
    .context("failed to arm flow sensor interrupt")?;
    info!(gpio = pin_num, "flow sensor armed");
    Ok(pin)
}

// ---------------------------------------------------------------------------
// Mock outputs (development: no hardware, logs state)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct RelayBoard {
    gpio: u8,
    on: AtomicBool,
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] relay registered (not wired)");
        Ok(Self {
            gpio: pin_num,
            on: AtomicBool::new(false),
        })
    }

    /// Last commanded state; the simulator only pumps water while on.
    #[cfg(any(test, feature = "sim"))]
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }
}

#[cfg(not(feature = "gpio"))]
impl Relay for RelayBoard {
    fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::Relaxed) == on {
            return;
        }
        info!(
            gpio = self.gpio,
            pump = if on { "ON" } else { "OFF" },
            "[mock-gpio] relay set"
        );
    }
}

#[cfg(not(feature = "gpio"))]
pub struct GrowLight {
    gpio: u8,
    level: AtomicU8,
}

#[cfg(not(feature = "gpio"))]
impl GrowLight {
    pub fn new(pin_num: u8) -> Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] grow light registered (not wired)");
        Ok(Self {
            gpio: pin_num,
            level: AtomicU8::new(0),
        })
    }

    #[cfg(test)]
    fn brightness(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }
}

#[cfg(not(feature = "gpio"))]
impl LightOutput for GrowLight {
    fn set_brightness(&self, brightness: u8) {
        let previous = self.level.swap(brightness, Ordering::Relaxed);
        info!(gpio = self.gpio, previous, brightness, "[mock-gpio] grow light set");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
