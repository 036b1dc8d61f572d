//! Millisecond timestamps for the control core.
//!
//! Every timestamp is a `u32` count of milliseconds since boot and wraps
//! after 2^32 ms (~49.7 days).  Timestamps are never compared directly;
//! elapsed time is always `now - since` in modular arithmetic, which stays
//! correct across one wraparound.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Wrapping monotonic timestamp in milliseconds.
pub type Millis = u32;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Millis;
}

/// Milliseconds from `since` to `now`, tolerant of timer wraparound.
#[inline]
pub fn elapsed(now: Millis, since: Millis) -> Millis {
    now.wrapping_sub(since)
}

/// Seconds to milliseconds, saturating instead of overflowing.
#[inline]
pub fn secs_to_millis(secs: u32) -> Millis {
    secs.saturating_mul(1000)
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Process-lifetime clock backed by [`Instant`], truncated to 32 bits so it
/// wraps like a 32-bit millisecond tick counter.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Millis {
        self.origin.elapsed().as_millis() as u32
    }
}

/// Hand-driven clock for tests and the simulator.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn starting_at(now: Millis) -> Self {
        Self {
            now: AtomicU32::new(now),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, ms: Millis) {
        let now = self.now.load(Ordering::Relaxed);
        self.now.store(now.wrapping_add(ms), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.load(Ordering::Relaxed)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_plain() {
        assert_eq!(elapsed(1_500, 1_000), 500);
    }

    #[test]
    fn elapsed_across_wraparound() {
        assert_eq!(elapsed(0x0000_0010, 0xFFFF_FFF0), 0x20);
    }

    #[test]
    fn secs_to_millis_saturates() {
        assert_eq!(secs_to_millis(780), 780_000);
        assert_eq!(secs_to_millis(u32::MAX), u32::MAX);
    }

    #[test]
    fn manual_clock_advance_wraps() {
        let clock = ManualClock::starting_at(0xFFFF_FFF0);
        clock.advance(0x20);
        assert_eq!(clock.now(), 0x10);
    }

    #[test]
    fn monotonic_clock_starts_near_zero() {
        let clock = MonotonicClock::new();
        assert!(clock.now() < 1_000);
    }
}
