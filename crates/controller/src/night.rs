//! Wall-clock night/day oracle.

use anyhow::{Context, Result};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use crate::config::NightConfig;

/// Before this the system clock has not been set (no RTC, no NTP yet).
const EARLIEST_PLAUSIBLE_YEAR: i32 = 2020;

pub struct NightOracle {
    start_hour: u8,
    end_hour: u8,
    offset: UtcOffset,
}

impl NightOracle {
    pub fn new(cfg: &NightConfig) -> Result<Self> {
        let offset = UtcOffset::from_hms(cfg.utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid UTC offset {}h", cfg.utc_offset_hours))?;
        Ok(Self {
            start_hour: cfg.start_hour,
            end_hour: cfg.end_hour,
            offset,
        })
    }

    /// Local time, or `None` while the clock is unsynchronised.
    pub fn local_now(&self) -> Option<OffsetDateTime> {
        self.local(OffsetDateTime::now_utc())
    }

    pub fn local_hour(&self) -> Option<u8> {
        self.local_now().map(|t| t.hour())
    }

    /// Night is `hour >= start || hour < end`.  An unsynchronised clock
    /// counts as day.
    pub fn is_night(&self) -> bool {
        self.local_hour().is_some_and(|h| self.is_night_hour(h))
    }

    pub fn is_night_hour(&self, hour: u8) -> bool {
        hour >= self.start_hour || hour < self.end_hour
    }

    fn local(&self, utc: OffsetDateTime) -> Option<OffsetDateTime> {
        (utc.year() >= EARLIEST_PLAUSIBLE_YEAR).then(|| utc.to_offset(self.offset))
    }
}

/// `DD-MM-YYYY HH:MM:SS`, or a placeholder when the clock is unknown.
pub fn format_datetime(t: Option<OffsetDateTime>) -> String {
    let fmt = format_description!("[day]-[month]-[year] [hour]:[minute]:[second]");
    t.and_then(|t| t.format(&fmt).ok())
        .unwrap_or_else(|| "time not available".to_string())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn oracle(offset: i8) -> NightOracle {
        NightOracle::new(&NightConfig {
            start_hour: 22,
            end_hour: 6,
            utc_offset_hours: offset,
        })
        .unwrap()
    }

    #[test]
    fn night_window_wraps_midnight() {
        let o = oracle(0);
        assert!(o.is_night_hour(22));
        assert!(o.is_night_hour(23));
        assert!(o.is_night_hour(0));
        assert!(o.is_night_hour(5));
        assert!(!o.is_night_hour(6));
        assert!(!o.is_night_hour(21));
    }

    #[test]
    fn offset_shifts_local_hour() {
        let o = oracle(2);
        let local = o.local(datetime!(2025-06-01 21:30 UTC)).unwrap();
        assert_eq!(local.hour(), 23);
        assert!(o.is_night_hour(local.hour()));
    }

    #[test]
    fn unsynced_clock_is_unknown() {
        let o = oracle(0);
        assert_eq!(o.local(datetime!(1970-01-01 00:10 UTC)), None);
    }

    #[test]
    fn datetime_format() {
        let t = datetime!(2025-03-07 08:05:09 UTC);
        assert_eq!(format_datetime(Some(t)), "07-03-2025 08:05:09");
        assert_eq!(format_datetime(None), "time not available");
    }
}
