//! Tunable system settings: temperature bands, duty cycles, flow and
//! lighting parameters.  Validation runs at the update boundary; the control
//! core only ever sees [`SystemSettings::sanitized`] copies.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::cycle::Band;

/// Shortest on/off phase the pump driver will run, in seconds.
pub const MIN_DURATION_SECS: u32 = 1;

/// Longest on/off phase, in seconds (one day).
pub const MAX_DURATION_SECS: u32 = 86_400;

/// YF-S201 hall-effect sensor: 7.5 Hz per L/min, i.e. 450 pulses per litre.
pub const DEFAULT_PULSES_PER_LITRE: f32 = 450.0;

pub const MAX_SYSTEM_NAME_LEN: usize = 31;

// ---------------------------------------------------------------------------
// Settings record
// ---------------------------------------------------------------------------

/// On/off duty cycle for one band, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCycle {
    pub on_secs: u32,
    pub off_secs: u32,
}

impl BandCycle {
    pub const fn new(on_secs: u32, off_secs: u32) -> Self {
        Self { on_secs, off_secs }
    }

    fn clamped(self) -> Self {
        Self {
            on_secs: self.on_secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS),
            off_secs: self.off_secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    pub system_name: String,

    /// Boundary between the low and mid band (°C).
    pub low_threshold_c: f32,
    /// Boundary between the mid and high band (°C).
    pub high_threshold_c: f32,

    pub low: BandCycle,
    pub mid: BandCycle,
    pub high: BandCycle,
    pub night: BandCycle,

    /// Hold the pump on permanently (NFT/DFT systems).
    pub continuous_mode: bool,

    pub min_flow_lpm: f32,
    pub flow_alert_enabled: bool,
    pub pulses_per_litre: f32,
    /// How long without a single flow pulse before a running pump counts as
    /// stalled.
    pub no_flow_silence_secs: u32,
    /// Keep checking flow while the operator has overridden the pump.
    pub fault_check_during_override: bool,

    pub led_auto_mode: bool,
    pub led_start_hour: u8,
    pub led_end_hour: u8,
    pub led_brightness: u8,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            system_name: "Hydro System 1".to_string(),
            low_threshold_c: 18.0,
            high_threshold_c: 25.0,
            low: BandCycle::new(120, 1080),
            mid: BandCycle::new(120, 780),
            high: BandCycle::new(120, 480),
            night: BandCycle::new(60, 1740),
            continuous_mode: false,
            min_flow_lpm: 1.0,
            flow_alert_enabled: true,
            pulses_per_litre: DEFAULT_PULSES_PER_LITRE,
            no_flow_silence_secs: 10,
            fault_check_during_override: true,
            led_auto_mode: true,
            led_start_hour: 6,
            led_end_hour: 22,
            led_brightness: 200,
        }
    }
}

impl SystemSettings {
    pub fn band(&self, band: Band) -> BandCycle {
        match band {
            Band::Low => self.low,
            Band::Mid => self.mid,
            Band::High => self.high,
            Band::Night => self.night,
        }
    }

    /// Validate all fields. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── Identity ────────────────────────────────────────────
        if self.system_name.trim().is_empty() {
            errors.push("system_name is empty".to_string());
        } else if self.system_name.chars().count() > MAX_SYSTEM_NAME_LEN {
            errors.push(format!(
                "system_name longer than {MAX_SYSTEM_NAME_LEN} characters"
            ));
        }

        // ── Temperature bands ───────────────────────────────────
        if !self.low_threshold_c.is_finite() || !self.high_threshold_c.is_finite() {
            errors.push("temperature thresholds must be finite numbers".to_string());
        } else if self.low_threshold_c >= self.high_threshold_c {
            errors.push(format!(
                "low_threshold_c ({}) must be below high_threshold_c ({})",
                self.low_threshold_c, self.high_threshold_c
            ));
        }

        for (name, cycle) in [
            ("low", self.low),
            ("mid", self.mid),
            ("high", self.high),
            ("night", self.night),
        ] {
            for (phase, secs) in [("on_secs", cycle.on_secs), ("off_secs", cycle.off_secs)] {
                if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&secs) {
                    errors.push(format!(
                        "{name}.{phase} {secs} out of range [{MIN_DURATION_SECS}, {MAX_DURATION_SECS}]"
                    ));
                }
            }
        }

        // ── Flow ────────────────────────────────────────────────
        if !self.min_flow_lpm.is_finite() || self.min_flow_lpm < 0.0 {
            errors.push(format!(
                "min_flow_lpm must be zero or positive, got {}",
                self.min_flow_lpm
            ));
        }
        if !self.pulses_per_litre.is_finite() || self.pulses_per_litre <= 0.0 {
            errors.push(format!(
                "pulses_per_litre must be positive, got {}",
                self.pulses_per_litre
            ));
        }
        if self.no_flow_silence_secs == 0 {
            errors.push("no_flow_silence_secs must be positive, got 0".to_string());
        }

        // ── Lighting ────────────────────────────────────────────
        if self.led_start_hour > 23 {
            errors.push(format!(
                "led_start_hour {} out of range [0, 23]",
                self.led_start_hour
            ));
        }
        if self.led_end_hour > 23 {
            errors.push(format!(
                "led_end_hour {} out of range [0, 23]",
                self.led_end_hour
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "settings validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Copy with every value the control core divides by or waits on forced
    /// into a usable range.  Used for records that bypassed validation, such
    /// as a corrupted persisted store.
    pub fn sanitized(&self) -> Self {
        let mut s = self.clone();
        s.low = s.low.clamped();
        s.mid = s.mid.clamped();
        s.high = s.high.clamped();
        s.night = s.night.clamped();
        if !s.pulses_per_litre.is_finite() || s.pulses_per_litre <= 0.0 {
            s.pulses_per_litre = DEFAULT_PULSES_PER_LITRE;
        }
        if !s.min_flow_lpm.is_finite() || s.min_flow_lpm < 0.0 {
            s.min_flow_lpm = 0.0;
        }
        s.no_flow_silence_secs = s.no_flow_silence_secs.max(1);
        s.led_start_hour = s.led_start_hour.min(23);
        s.led_end_hour = s.led_end_hour.min(23);
        s
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Partial settings update as received from the configuration API.  Absent
/// fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub system_name: Option<String>,
    pub low_threshold_c: Option<f32>,
    pub high_threshold_c: Option<f32>,
    pub low: Option<BandCycle>,
    pub mid: Option<BandCycle>,
    pub high: Option<BandCycle>,
    pub night: Option<BandCycle>,
    pub continuous_mode: Option<bool>,
    pub min_flow_lpm: Option<f32>,
    pub flow_alert_enabled: Option<bool>,
    pub pulses_per_litre: Option<f32>,
    pub no_flow_silence_secs: Option<u32>,
    pub fault_check_during_override: Option<bool>,
    pub led_auto_mode: Option<bool>,
    pub led_start_hour: Option<u8>,
    pub led_end_hour: Option<u8>,
    pub led_brightness: Option<u8>,
}

impl SettingsPatch {
    /// Merge onto `base` and validate the result as a whole.
    pub fn apply_to(self, base: &SystemSettings) -> Result<SystemSettings> {
        let mut s = base.clone();

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { s.$field = v; })*
            };
        }
        merge!(
            system_name,
            low_threshold_c,
            high_threshold_c,
            low,
            mid,
            high,
            night,
            continuous_mode,
            min_flow_lpm,
            flow_alert_enabled,
            pulses_per_litre,
            no_flow_silence_secs,
            fault_check_during_override,
            led_auto_mode,
            led_start_hour,
            led_end_hour,
            led_brightness,
        );

        s.validate()?;
        Ok(s)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(s: &SystemSettings, needle: &str) {
        let err = s.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Defaults ---------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        SystemSettings::default().validate().unwrap();
    }

    #[test]
    fn default_band_durations() {
        let s = SystemSettings::default();
        assert_eq!(s.mid, BandCycle::new(120, 780));
        assert_eq!(s.night, BandCycle::new(60, 1740));
        assert_eq!(s.low_threshold_c, 18.0);
        assert_eq!(s.high_threshold_c, 25.0);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn inverted_thresholds_rejected() {
        let s = SystemSettings {
            low_threshold_c: 25.0,
            high_threshold_c: 18.0,
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "must be below high_threshold_c");
    }

    #[test]
    fn equal_thresholds_rejected() {
        let s = SystemSettings {
            low_threshold_c: 20.0,
            high_threshold_c: 20.0,
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "must be below high_threshold_c");
    }

    #[test]
    fn nan_threshold_rejected() {
        let s = SystemSettings {
            low_threshold_c: f32::NAN,
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "finite");
    }

    #[test]
    fn zero_duration_rejected() {
        let s = SystemSettings {
            mid: BandCycle::new(0, 780),
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "mid.on_secs 0 out of range");
    }

    #[test]
    fn oversized_duration_rejected() {
        let s = SystemSettings {
            night: BandCycle::new(60, MAX_DURATION_SECS + 1),
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "night.off_secs");
    }

    #[test]
    fn zero_calibration_rejected() {
        let s = SystemSettings {
            pulses_per_litre: 0.0,
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "pulses_per_litre must be positive");
    }

    #[test]
    fn empty_name_rejected() {
        let s = SystemSettings {
            system_name: "  ".into(),
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "system_name is empty");
    }

    #[test]
    fn long_name_rejected() {
        let s = SystemSettings {
            system_name: "x".repeat(32),
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "longer than 31");
    }

    #[test]
    fn led_hour_out_of_range_rejected() {
        let s = SystemSettings {
            led_end_hour: 24,
            ..SystemSettings::default()
        };
        assert_validation_err(&s, "led_end_hour 24");
    }

    #[test]
    fn multiple_errors_collected() {
        let s = SystemSettings {
            system_name: String::new(),
            low: BandCycle::new(0, 0),
            pulses_per_litre: -1.0,
            ..SystemSettings::default()
        };
        let msg = format!("{:#}", s.validate().unwrap_err());
        assert!(msg.contains("(4 errors)"), "{msg}");
        assert!(msg.contains("system_name is empty"), "{msg}");
        assert!(msg.contains("low.on_secs"), "{msg}");
        assert!(msg.contains("low.off_secs"), "{msg}");
        assert!(msg.contains("pulses_per_litre"), "{msg}");
    }

    // -- Sanitizing -------------------------------------------------------

    #[test]
    fn sanitized_clamps_zero_durations() {
        let s = SystemSettings {
            high: BandCycle::new(0, 0),
            ..SystemSettings::default()
        }
        .sanitized();
        assert_eq!(s.high, BandCycle::new(1, 1));
    }

    #[test]
    fn sanitized_restores_calibration() {
        let s = SystemSettings {
            pulses_per_litre: f32::NAN,
            ..SystemSettings::default()
        }
        .sanitized();
        assert_eq!(s.pulses_per_litre, DEFAULT_PULSES_PER_LITRE);
    }

    #[test]
    fn sanitized_leaves_valid_settings_untouched() {
        let s = SystemSettings::default();
        assert_eq!(s.sanitized(), s);
    }

    // -- Patches ----------------------------------------------------------

    #[test]
    fn patch_merges_only_present_fields() {
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"continuous_mode":true,"mid":{"on_secs":90,"off_secs":600}}"#)
                .unwrap();
        let s = patch.apply_to(&SystemSettings::default()).unwrap();
        assert!(s.continuous_mode);
        assert_eq!(s.mid, BandCycle::new(90, 600));
        assert_eq!(s.low, SystemSettings::default().low);
    }

    #[test]
    fn patch_rejects_inverted_thresholds() {
        let patch = SettingsPatch {
            low_threshold_c: Some(30.0),
            ..SettingsPatch::default()
        };
        assert!(patch.apply_to(&SystemSettings::default()).is_err());
    }

    #[test]
    fn patch_rejects_unknown_fields() {
        assert!(serde_json::from_str::<SettingsPatch>(r#"{"bogus":1}"#).is_err());
    }

    #[test]
    fn settings_deserialize_fills_missing_with_defaults() {
        let s: SystemSettings = serde_json::from_str(r#"{"system_name":"Tower"}"#).unwrap();
        assert_eq!(s.system_name, "Tower");
        assert_eq!(s.mid, SystemSettings::default().mid);
    }
}
