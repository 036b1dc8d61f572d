//! Water flow estimation from hall-effect sensor pulses.
//!
//! The sensor emits one pulse per fixed volume of water.  A GPIO interrupt
//! calls [`PulseCounter::on_interrupt`] for every falling edge; the control
//! loop periodically calls [`FlowEstimator::sample`], which atomically takes
//! and zeroes the counter and turns the pulse delta into a rate and a
//! running volume total.
//!
//! The counter is the only state shared between the interrupt context and
//! the control loop.  `take_and_reset` is a single atomic swap, so a pulse
//! that lands during sampling is counted in either this window or the next,
//! never lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::clock::{elapsed, Millis};

/// Default sampling window.
pub const SAMPLE_WINDOW_MS: Millis = 1_000;

/// A last-pulse timestamp older than this is forgotten, so the wrapping
/// clock can never make an ancient pulse look recent.
const PULSE_MEMORY_MS: Millis = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Interrupt-side counter
// ---------------------------------------------------------------------------

/// Pulse counter written from interrupt context.
#[derive(Debug, Default)]
pub struct PulseCounter {
    pulses: AtomicU32,
    last_pulse_at: AtomicU32,
}

/// Result of [`PulseCounter::take_and_reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseTake {
    pub count: u32,
    /// Timestamp of the most recent pulse; only meaningful when `count > 0`.
    pub last_pulse_at: Millis,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            pulses: AtomicU32::new(0),
            last_pulse_at: AtomicU32::new(0),
        }
    }

    /// Record one pulse.  Safe to call from an interrupt handler: two atomic
    /// stores, no locking, no allocation, no logging.
    #[inline]
    pub fn on_interrupt(&self, now: Millis) {
        self.last_pulse_at.store(now, Ordering::Relaxed);
        // Release pairs with the Acquire swap below so a counted pulse always
        // has its timestamp visible.
        self.pulses.fetch_add(1, Ordering::Release);
    }

    /// Atomically read and zero the pulse count.
    pub fn take_and_reset(&self) -> PulseTake {
        let count = self.pulses.swap(0, Ordering::Acquire);
        PulseTake {
            count,
            last_pulse_at: self.last_pulse_at.load(Ordering::Relaxed),
        }
    }

    /// Pulses counted since the last take.
    pub fn pending(&self) -> u32 {
        self.pulses.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// One completed sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlowSample {
    pub pulses: u32,
    pub window_ms: Millis,
    pub rate_lpm: f32,
    pub litres: f32,
}

pub struct FlowEstimator {
    counter: Arc<PulseCounter>,
    window_ms: Millis,
    last_sample_at: Millis,
    last_pulse_at: Option<Millis>,
    current_rate_lpm: Option<f32>,
    total_litres: f64,
    total_pulses: u64,
}

impl FlowEstimator {
    pub fn new(counter: Arc<PulseCounter>, window_ms: Millis, now: Millis) -> Self {
        Self {
            counter,
            window_ms: window_ms.max(1),
            last_sample_at: now,
            last_pulse_at: None,
            current_rate_lpm: None,
            total_litres: 0.0,
            total_pulses: 0,
        }
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }

    /// Close the current window if it has run its full length.
    ///
    /// Returns `None` (and changes nothing) when called early, so it is safe
    /// to call on every loop iteration.
    pub fn sample(&mut self, now: Millis, pulses_per_litre: f32) -> Option<FlowSample> {
        let window_ms = elapsed(now, self.last_sample_at);
        if window_ms < self.window_ms {
            return None;
        }

        let take = self.counter.take_and_reset();
        self.last_sample_at = now;

        if take.count > 0 {
            self.last_pulse_at = Some(take.last_pulse_at);
        } else if let Some(at) = self.last_pulse_at {
            if elapsed(now, at) > PULSE_MEMORY_MS {
                self.last_pulse_at = None;
            }
        }

        let litres = take.count as f32 / pulses_per_litre;
        let rate_lpm = litres / (window_ms as f32 / 60_000.0);

        self.current_rate_lpm = Some(rate_lpm);
        self.total_litres += f64::from(litres);
        self.total_pulses += u64::from(take.count);

        Some(FlowSample {
            pulses: take.count,
            window_ms,
            rate_lpm,
            litres,
        })
    }

    /// Zero the volume total and discard pulses of the window in progress.
    /// The rate becomes unknown until the next full window.
    pub fn reset(&mut self, now: Millis) {
        let discarded = self.counter.take_and_reset();
        if discarded.count > 0 {
            self.last_pulse_at = Some(discarded.last_pulse_at);
        }
        self.last_sample_at = now;
        self.current_rate_lpm = None;
        self.total_litres = 0.0;
        self.total_pulses = 0;
    }

    /// Flow rate over the last full window (L/min), `None` until one window
    /// has completed since start-up or the last reset.
    pub fn current_rate_lpm(&self) -> Option<f32> {
        self.current_rate_lpm
    }

    pub fn total_litres(&self) -> f64 {
        self.total_litres
    }

    pub fn total_pulses(&self) -> u64 {
        self.total_pulses
    }

    /// Milliseconds since the last observed pulse, `None` if none was seen.
    pub fn since_last_pulse(&self, now: Millis) -> Option<Millis> {
        self.last_pulse_at.map(|at| {
            let since = elapsed(now, at);
            // A pulse stamped after `now` was read (interrupt raced the
            // sampler) shows up as a near-2^32 gap.
            if since > i32::MAX as u32 {
                0
            } else {
                since
            }
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
