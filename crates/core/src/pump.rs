//! Pump cycle driver: the relay's on/off state machine.
//!
//! ## State machine
//!
//! ```text
//!          elapsed >= off_secs
//!   OFF ─────────────────────────▶ ON
//!    ▲                              │
//!    └──────────────────────────────┘
//!          elapsed >= on_secs
//! ```
//!
//! Continuous mode forces ON.  A manual override freezes the machine and
//! drives the relay straight from operator input until it is cleared.
//!
//! The driver never touches hardware itself; every method that changes the
//! relay returns a [`Transition`] for the caller to apply and log.

use serde::Serialize;

use crate::clock::{elapsed, secs_to_millis, Millis};
use crate::cycle::Cycle;

/// Why the relay changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchCause {
    Auto,
    Continuous,
    Override,
}

impl SwitchCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchCause::Auto => "auto",
            SwitchCause::Continuous => "continuous",
            SwitchCause::Override => "override",
        }
    }
}

/// A relay state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub on: bool,
    pub at: Millis,
    pub cause: SwitchCause,
    /// Length of the ON interval that just ended (ON → OFF only).
    pub ran_ms: Option<Millis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PumpCycleState {
    pub relay_on: bool,
    pub state_entered_at: Millis,
    pub manual_override_active: bool,
    pub manual_override_value: bool,
}

pub struct PumpCycleDriver {
    state: PumpCycleState,
    /// Start of the current physical ON interval.  Unlike `state_entered_at`
    /// this is not reset when an override re-asserts the same relay state.
    on_since: Millis,
    runtime_ms: u64,
    cycle: Option<Cycle>,
}

impl PumpCycleDriver {
    /// New driver with the relay OFF and the OFF phase starting at `now`.
    pub fn new(now: Millis) -> Self {
        Self {
            state: PumpCycleState {
                relay_on: false,
                state_entered_at: now,
                manual_override_active: false,
                manual_override_value: false,
            },
            on_since: now,
            runtime_ms: 0,
            cycle: None,
        }
    }

    pub fn state(&self) -> PumpCycleState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state.relay_on
    }

    pub fn override_active(&self) -> bool {
        self.state.manual_override_active
    }

    /// Cycle seen by the most recent [`tick`](Self::tick).
    pub fn cycle(&self) -> Option<Cycle> {
        self.cycle
    }

    /// How long the pump has been running, or `None` while it is off.
    pub fn on_for(&self, now: Millis) -> Option<Millis> {
        self.state.relay_on.then(|| elapsed(now, self.on_since))
    }

    /// Total pump runtime including the interval in progress.
    pub fn runtime_ms(&self, now: Millis) -> u64 {
        self.runtime_ms + self.on_for(now).map_or(0, u64::from)
    }

    /// Advance the automatic cycle.  Calling twice with the same `now` never
    /// produces a second transition.
    pub fn tick(&mut self, now: Millis, cycle: Cycle) -> Option<Transition> {
        self.cycle = Some(cycle);

        if self.state.manual_override_active {
            return None;
        }

        let Some((on_secs, off_secs)) = cycle.durations() else {
            return if self.state.relay_on {
                None
            } else {
                Some(self.switch(true, now, SwitchCause::Continuous))
            };
        };

        let in_state = elapsed(now, self.state.state_entered_at);
        if self.state.relay_on {
            (in_state >= secs_to_millis(on_secs)).then(|| self.switch(false, now, SwitchCause::Auto))
        } else {
            (in_state >= secs_to_millis(off_secs)).then(|| self.switch(true, now, SwitchCause::Auto))
        }
    }

    /// Enter or leave manual override.
    ///
    /// Activating drives the relay to `value` immediately and restarts the
    /// phase clock.  Deactivating leaves the relay where it is and restarts
    /// the phase clock so automatic control resumes from a fresh phase.
    pub fn set_override(&mut self, active: bool, value: bool, now: Millis) -> Option<Transition> {
        if active {
            self.state.manual_override_active = true;
            self.state.manual_override_value = value;
            let transition = (self.state.relay_on != value)
                .then(|| self.switch(value, now, SwitchCause::Override));
            self.state.state_entered_at = now;
            transition
        } else {
            if self.state.manual_override_active {
                self.state.manual_override_active = false;
                self.state.state_entered_at = now;
            }
            None
        }
    }

    fn switch(&mut self, on: bool, now: Millis, cause: SwitchCause) -> Transition {
        let ran_ms = if on {
            self.on_since = now;
            None
        } else {
            let ran = elapsed(now, self.on_since);
            self.runtime_ms += u64::from(ran);
            Some(ran)
        };

        self.state.relay_on = on;
        self.state.state_entered_at = now;

        Transition {
            on,
            at: now,
            cause,
            ran_ms,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
