//! Stalled-flow detection.
//!
//! # State machine
//!
//! ```text
//!            gates pass && stalled
//!   OK ─────────────────────────────▶ FAULT
//!    ▲                                  │
//!    │  rate back at or above minimum   │
//!    ├──────────────────────────────────┘
//!    │  pump off / checking disabled    │
//!    └──────────────────────────────────┘
//! ```
//!
//! "Stalled" means the last full flow window measured below the minimum
//! rate *and* no pulse has been seen for the silence window.  Requiring both
//! keeps a single empty window right after a counter reset from raising a
//! fault.  Once faulted, only the rate can clear it: a clogged line that
//! still drips resets the silence timer without recovering.
//!
//! While the pump is inside its priming grace period, or no full flow window
//! exists yet, the detector holds its current state.

use serde::Serialize;

use crate::clock::{secs_to_millis, Millis};
use crate::settings::SystemSettings;

/// How long the pump must have been running before flow is judged.
pub const PRIMING_GRACE_MS: Millis = 5_000;

/// Result of [`FlowFaultDetector::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultStatus {
    /// No fault.
    Normal,
    /// Fault just confirmed.  Returned exactly once per episode.
    Triggered,
    /// Still faulted.
    Active,
    /// Fault just cleared.  Returned exactly once per episode.
    Resolved,
}

/// Everything the detector looks at on one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowCheck {
    pub pump_on: bool,
    /// How long the pump has been running; `None` while it is off.
    pub pump_on_for: Option<Millis>,
    /// False when an override is active and checking during override is
    /// disabled.
    pub checking_enabled: bool,
    /// Rate over the last full window; `None` before the first one.
    pub rate_lpm: Option<f32>,
    pub since_last_pulse: Option<Millis>,
    pub min_flow_lpm: f32,
    pub silence_ms: Millis,
}

impl FlowCheck {
    /// Build a check from the pump state, estimator readings and settings.
    pub fn new(
        pump_on_for: Option<Millis>,
        override_active: bool,
        rate_lpm: Option<f32>,
        since_last_pulse: Option<Millis>,
        settings: &SystemSettings,
    ) -> Self {
        Self {
            pump_on: pump_on_for.is_some(),
            pump_on_for,
            checking_enabled: !override_active || settings.fault_check_during_override,
            rate_lpm,
            since_last_pulse,
            min_flow_lpm: settings.min_flow_lpm,
            silence_ms: secs_to_millis(settings.no_flow_silence_secs),
        }
    }

    fn rate_low(&self) -> Option<bool> {
        self.rate_lpm.map(|rate| rate < self.min_flow_lpm)
    }

    fn silent(&self) -> bool {
        self.since_last_pulse.map_or(true, |since| since > self.silence_ms)
    }
}

#[derive(Debug, Default)]
pub struct FlowFaultDetector {
    fault_active: bool,
    no_flow_detected: bool,
}

impl FlowFaultDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a stalled-flow condition has been confirmed.
    pub fn fault_active(&self) -> bool {
        self.fault_active
    }

    /// True while the last judged window measured below the minimum rate,
    /// whether or not that has become a fault yet.
    pub fn no_flow_detected(&self) -> bool {
        self.no_flow_detected
    }

    pub fn evaluate(&mut self, check: &FlowCheck) -> FaultStatus {
        if !check.pump_on || !check.checking_enabled {
            self.no_flow_detected = false;
            return self.set(false);
        }

        let primed = check.pump_on_for.is_some_and(|on| on > PRIMING_GRACE_MS);
        let Some(rate_low) = check.rate_low().filter(|_| primed) else {
            return self.hold();
        };

        self.no_flow_detected = rate_low;
        if self.fault_active {
            self.set(rate_low)
        } else {
            self.set(rate_low && check.silent())
        }
    }

    fn hold(&self) -> FaultStatus {
        if self.fault_active {
            FaultStatus::Active
        } else {
            FaultStatus::Normal
        }
    }

    fn set(&mut self, stalled: bool) -> FaultStatus {
        match (self.fault_active, stalled) {
            (false, false) => FaultStatus::Normal,
            (false, true) => {
                self.fault_active = true;
                FaultStatus::Triggered
            }
            (true, true) => FaultStatus::Active,
            (true, false) => {
                self.fault_active = false;
                FaultStatus::Resolved
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
