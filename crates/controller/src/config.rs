//! TOML service config: hardware pins, optional subsystems, web, MQTT and
//! night schedule, with environment overrides and validation.
//!
//! Tunable pump settings are not configured here; they live in the settings
//! store.  The optional `[settings]` table only seeds an empty store.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use hydro_core::SystemSettings;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub hardware: HardwareConfig,
    pub features: Features,
    pub web: WebConfig,
    pub mqtt: MqttConfig,
    pub night: NightConfig,
    pub sim: SimConfig,
    pub settings: Option<SystemSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HardwareConfig {
    pub relay_pin: i64,
    /// Many common relay boards are active-low.
    pub relay_active_low: bool,
    pub flow_sensor_pin: i64,
    pub light_pin: i64,
    /// `w1_slave` file of the DS18B20.  When unset the first `28-*` device
    /// on the 1-wire bus is used.
    pub probe_path: Option<String>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pin: 17,
            relay_active_low: true,
            flow_sensor_pin: 27,
            light_pin: 18,
            probe_path: None,
        }
    }
}

/// Optional subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Features {
    pub flow_sensor: bool,
    pub alerts: bool,
    pub lighting: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            flow_sensor: true,
            alerts: true,
            lighting: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebConfig {
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "hydro-controller".to_string(),
            topic_prefix: "hydro".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NightConfig {
    pub start_hour: u8,
    pub end_hour: u8,
    pub utc_offset_hours: i8,
}

impl Default for NightConfig {
    fn default() -> Self {
        Self {
            start_hour: 22,
            end_hour: 6,
            utc_offset_hours: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub scenario: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scenario: "healthy".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pins(&mut errors);
        self.validate_network(&mut errors);

        // ── Night schedule ──────────────────────────────────────
        for (name, hour) in [
            ("night.start_hour", self.night.start_hour),
            ("night.end_hour", self.night.end_hour),
        ] {
            if hour > 23 {
                errors.push(format!("{name} {hour} out of range [0, 23]"));
            }
        }
        if !(-12..=14).contains(&self.night.utc_offset_hours) {
            errors.push(format!(
                "night.utc_offset_hours {} out of range [-12, 14]",
                self.night.utc_offset_hours
            ));
        }

        // ── Settings seed ───────────────────────────────────────
        if let Some(seed) = &self.settings {
            if let Err(e) = seed.validate() {
                errors.push(format!("[settings]: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let hw = &self.hardware;
        let mut pins: Vec<(&str, i64)> = vec![("relay_pin", hw.relay_pin)];
        if self.features.flow_sensor {
            pins.push(("flow_sensor_pin", hw.flow_sensor_pin));
        }
        if self.features.lighting {
            pins.push(("light_pin", hw.light_pin));
        }

        let mut seen: HashSet<i64> = HashSet::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "hardware.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(pin) {
                errors.push(format!(
                    "hardware.{name} {pin} is already used by another output"
                ));
            }
        }
    }

    fn validate_network(&self, errors: &mut Vec<String>) {
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if self.web.tls_cert.is_some() != self.web.tls_key.is_some() {
            errors.push("web.tls_cert and web.tls_key must be set together".to_string());
        }

        if self.mqtt.enabled {
            if self.mqtt.host.trim().is_empty() {
                errors.push("mqtt.host is empty".to_string());
            }
            if self.mqtt.port == 0 {
                errors.push("mqtt.port must be non-zero".to_string());
            }
            if self.mqtt.client_id.trim().is_empty() {
                errors.push("mqtt.client_id is empty".to_string());
            }
            let prefix = &self.mqtt.topic_prefix;
            if prefix.trim().is_empty() {
                errors.push("mqtt.topic_prefix is empty".to_string());
            } else if prefix.contains(['+', '#']) || prefix.ends_with('/') {
                errors.push(format!(
                    "mqtt.topic_prefix '{prefix}' must not contain wildcards or a trailing '/'"
                ));
            }
        }
    }

    /// Apply environment overrides.  `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = v
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.hardware.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("SIM_SCENARIO") {
            self.sim.scenario = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides and
/// validate.  A missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
