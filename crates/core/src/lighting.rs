//! Grow-light schedule with manual override.

use serde::Serialize;

use crate::settings::SystemSettings;

/// True when `hour` lies in the `[start, end)` window.  A window with
/// `start >= end` wraps past midnight (22–06 covers 22:00 to 05:59).
pub fn in_window(hour: u8, start: u8, end: u8) -> bool {
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Brightness the schedule asks for at local `hour`.
pub fn scheduled_brightness(hour: u8, settings: &SystemSettings) -> u8 {
    if settings.led_auto_mode && in_window(hour, settings.led_start_hour, settings.led_end_hour) {
        settings.led_brightness
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LightState {
    pub brightness: u8,
    pub override_active: bool,
    pub override_brightness: u8,
}

#[derive(Debug, Default)]
pub struct LightController {
    brightness: u8,
    override_active: bool,
    override_brightness: u8,
}

impl LightController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LightState {
        LightState {
            brightness: self.brightness,
            override_active: self.override_active,
            override_brightness: self.override_brightness,
        }
    }

    /// Follow the schedule.  Returns the new brightness when it changes.
    ///
    /// Does nothing while overridden or when the local hour is unknown.
    pub fn update(&mut self, local_hour: Option<u8>, settings: &SystemSettings) -> Option<u8> {
        if self.override_active {
            return None;
        }
        let hour = local_hour?;
        self.apply(scheduled_brightness(hour, settings))
    }

    /// Pin the light to `brightness`, or hand it back to the schedule.
    pub fn set_override(
        &mut self,
        active: bool,
        brightness: u8,
        local_hour: Option<u8>,
        settings: &SystemSettings,
    ) -> Option<u8> {
        if active {
            self.override_active = true;
            self.override_brightness = brightness;
            self.apply(brightness)
        } else if self.override_active {
            self.override_active = false;
            self.update(local_hour, settings)
        } else {
            None
        }
    }

    fn apply(&mut self, target: u8) -> Option<u8> {
        (target != self.brightness).then(|| {
            self.brightness = target;
            target
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(start: u8, end: u8) -> SystemSettings {
        SystemSettings {
            led_auto_mode: true,
            led_start_hour: start,
            led_end_hour: end,
            led_brightness: 180,
            ..SystemSettings::default()
        }
    }

    // -- Schedule -----------------------------------------------------------

    #[test]
    fn daytime_window() {
        assert!(!in_window(5, 6, 22));
        assert!(in_window(6, 6, 22));
        assert!(in_window(21, 6, 22));
        assert!(!in_window(22, 6, 22));
    }

    #[test]
    fn window_wraps_past_midnight() {
        assert!(in_window(23, 22, 6));
        assert!(in_window(0, 22, 6));
        assert!(in_window(5, 22, 6));
        assert!(!in_window(6, 22, 6));
        assert!(!in_window(12, 22, 6));
    }

    #[test]
    fn equal_hours_mean_always_on() {
        for h in 0..24 {
            assert!(in_window(h, 8, 8));
        }
    }

    #[test]
    fn auto_mode_off_means_dark() {
        let s = SystemSettings {
            led_auto_mode: false,
            ..settings(6, 22)
        };
        assert_eq!(scheduled_brightness(12, &s), 0);
    }

    // -- Controller ---------------------------------------------------------

    #[test]
    fn update_reports_only_changes() {
        let s = settings(6, 22);
        let mut light = LightController::new();
        assert_eq!(light.update(Some(5), &s), None);
        assert_eq!(light.update(Some(6), &s), Some(180));
        assert_eq!(light.update(Some(7), &s), None);
        assert_eq!(light.update(Some(22), &s), Some(0));
    }

    #[test]
    fn unknown_hour_leaves_light_alone() {
        let s = settings(6, 22);
        let mut light = LightController::new();
        light.update(Some(12), &s);
        assert_eq!(light.update(None, &s), None);
        assert_eq!(light.state().brightness, 180);
    }

    #[test]
    fn override_suspends_schedule() {
        let s = settings(6, 22);
        let mut light = LightController::new();
        assert_eq!(light.set_override(true, 40, Some(12), &s), Some(40));
        assert_eq!(light.update(Some(12), &s), None);
        assert_eq!(light.state().brightness, 40);

        assert_eq!(light.set_override(false, 0, Some(12), &s), Some(180));
        assert!(!light.state().override_active);
    }
}
