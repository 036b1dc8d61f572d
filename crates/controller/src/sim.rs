//! Water temperature and flow sensor simulator for local development.
//!
//! - Temperature: random walk with mean reversion around a scenario set
//!   point, plus a diurnal swing.
//! - Flow: while the (mock) relay is on, emits pulses through the same
//!   `PulseCounter::on_interrupt` path the GPIO interrupt uses, shaped by the
//!   scenario (healthy, clogged, intermittent).

use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hydro_core::clock::{elapsed, Clock, Millis};
use hydro_core::PulseCounter;

use crate::probe::TemperatureSource;
use crate::relay::RelayBoard;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `[sim] scenario` or `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Mild water, steady flow.  Mid band all day.
    Healthy,
    /// Flow stops one minute into every pump run.  Exercises the fault
    /// detector and alert path.
    Clogged,
    /// Flow comes and goes in bursts, long enough gaps to fault and recover.
    Intermittent,
    /// Cold reservoir, low band.
    Cold,
    /// Warm reservoir, high band.
    Hot,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "clogged" => Self::Clogged,
            "intermittent" => Self::Intermittent,
            "cold" => Self::Cold,
            "hot" => Self::Hot,
            _ => Self::Healthy, // default
        }
    }

    /// Reservoir set point in °C.
    fn center_c(self) -> f64 {
        match self {
            Self::Cold => 14.0,
            Self::Hot => 28.5,
            _ => 21.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Clogged => write!(f, "clogged"),
            Self::Intermittent => write!(f, "intermittent"),
            Self::Cold => write!(f, "cold"),
            Self::Hot => write!(f, "hot"),
        }
    }
}

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

pub struct WaterTempSim {
    temp_c: f64,
    center_c: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    diurnal_amplitude: f64,
    diurnal_period_s: f64,
}

impl WaterTempSim {
    /// `diurnal_period_s` is the day/night cycle length.  Use 600 for fast
    /// dev iteration or 86400 for real time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let center_c = scenario.center_c();
        Self {
            temp_c: center_c + approx_std_normal() * 0.3,
            center_c,
            walk_sigma: 0.05,
            mean_reversion: 0.05,
            diurnal_amplitude: 1.5,
            diurnal_period_s,
        }
    }

    /// Next reading at wall-clock second `now_s`.
    pub fn sample_at(&mut self, now_s: f64) -> f32 {
        let pull = self.mean_reversion * (self.center_c - self.temp_c);
        let walk = self.walk_sigma * approx_std_normal();
        self.temp_c += pull + walk;

        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let diurnal = self.diurnal_amplitude * phase.sin();

        // DS18B20 resolution is 1/16 °C.
        (((self.temp_c + diurnal) * 16.0).round() / 16.0) as f32
    }
}

impl TemperatureSource for WaterTempSim {
    fn read_celsius(&mut self) -> Result<f32> {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Ok(self.sample_at(now_s))
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Healthy pump throughput.
const NOMINAL_LPM: f64 = 2.5;

/// Clogged scenario: flow lasts this long into each run.
const CLOG_AFTER_MS: Millis = 60_000;

/// Intermittent scenario: flowing / stalled phase lengths.
const BURST_ON_MS: Millis = 20_000;
const BURST_OFF_MS: Millis = 18_000;

pub struct FlowSim {
    scenario: Scenario,
    pulses_per_litre: f64,
    on_since: Option<Millis>,
    carry: f64,
}

impl FlowSim {
    pub fn new(scenario: Scenario, pulses_per_litre: f32) -> Self {
        Self {
            scenario,
            pulses_per_litre: f64::from(pulses_per_litre),
            on_since: None,
            carry: 0.0,
        }
    }

    /// Number of pulses the sensor would emit over the last `dt_ms`.
    pub fn step(&mut self, now: Millis, dt_ms: Millis, pump_on: bool) -> u32 {
        if !pump_on {
            self.on_since = None;
            self.carry = 0.0;
            return 0;
        }
        let on_since = *self.on_since.get_or_insert(now);
        let running = elapsed(now, on_since);

        let flowing = match self.scenario {
            Scenario::Clogged => running < CLOG_AFTER_MS,
            Scenario::Intermittent => running % (BURST_ON_MS + BURST_OFF_MS) < BURST_ON_MS,
            _ => true,
        };
        if !flowing {
            self.carry = 0.0;
            return 0;
        }

        let jitter = 1.0 + 0.05 * approx_std_normal();
        let pulses_per_ms = NOMINAL_LPM * self.pulses_per_litre / 60_000.0;
        let expected = (pulses_per_ms * f64::from(dt_ms) * jitter).max(0.0) + self.carry;
        let whole = expected.floor();
        self.carry = expected - whole;
        whole as u32
    }
}

/// Step the flow simulator against the mock relay, feeding pulses into
/// `counter` as the sensor interrupt would.  Intended to be `tokio::spawn`-ed.
pub async fn run_flow(
    mut sim: FlowSim,
    relay: Arc<RelayBoard>,
    counter: Arc<PulseCounter>,
    clock: Arc<dyn Clock>,
) {
    const STEP_MS: Millis = 50;
    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(STEP_MS)));
    loop {
        ticker.tick().await;
        let now = clock.now();
        for _ in 0..sim.step(now, STEP_MS, relay.is_on()) {
            counter.on_interrupt(now);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
