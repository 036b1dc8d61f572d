//! Duty-cycle selection from temperature bands and the day/night schedule.

use serde::Serialize;

use crate::settings::SystemSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Mid,
    High,
    Night,
}

/// What the pump should be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Cycle {
    /// Pump held on; band durations unused.
    Continuous,
    /// Repeating on/off phases.
    Interval {
        band: Band,
        on_secs: u32,
        off_secs: u32,
    },
}

impl Cycle {
    /// `(on_secs, off_secs)`, or `None` in continuous mode.
    pub fn durations(&self) -> Option<(u32, u32)> {
        match *self {
            Cycle::Continuous => None,
            Cycle::Interval {
                on_secs, off_secs, ..
            } => Some((on_secs, off_secs)),
        }
    }
}

/// Classify a daytime water temperature.
///
/// Boundary values belong to the upper band: `low_threshold_c` is mid and
/// `high_threshold_c` is high.
pub fn classify(temperature_c: f32, settings: &SystemSettings) -> Band {
    if temperature_c < settings.low_threshold_c {
        Band::Low
    } else if temperature_c < settings.high_threshold_c {
        Band::Mid
    } else {
        Band::High
    }
}

/// Pick the duty cycle for the current conditions.
///
/// Continuous mode wins over everything; at night the night band applies
/// regardless of temperature.
pub fn select_cycle(
    temperature_c: f32,
    is_night: bool,
    continuous_mode: bool,
    settings: &SystemSettings,
) -> Cycle {
    if continuous_mode {
        return Cycle::Continuous;
    }

    let band = if is_night {
        Band::Night
    } else {
        classify(temperature_c, settings)
    };
    let durations = settings.band(band);

    Cycle::Interval {
        band,
        on_secs: durations.on_secs,
        off_secs: durations.off_secs,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
