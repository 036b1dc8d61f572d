//! DS18B20 water temperature probe.
//!
//! The kernel's `w1-therm` driver exposes each probe as
//! `/sys/bus/w1/devices/28-xxxxxxxxxxxx/w1_slave`:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```
//!
//! `t=` is milli-degrees Celsius.  A `NO` CRC line, the power-on value 85 °C
//! and the disconnected value −127 °C are all read failures.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const W1_DEVICES: &str = "/sys/bus/w1/devices";

/// Used until the first successful read.
pub const FALLBACK_TEMPERATURE_C: f32 = 20.0;

const POWER_ON_MILLI_C: i32 = 85_000;
const DISCONNECTED_MILLI_C: i32 = -127_000;

/// Something that can produce a water temperature.
pub trait TemperatureSource: Send {
    fn read_celsius(&mut self) -> Result<f32>;
}

// ---------------------------------------------------------------------------
// w1_slave parsing
// ---------------------------------------------------------------------------

pub fn parse_w1_slave(contents: &str) -> Result<f32> {
    let mut lines = contents.lines();
    let crc_line = lines.next().context("w1_slave is empty")?;
    if !crc_line.trim_end().ends_with("YES") {
        bail!("CRC check failed: {crc_line}");
    }

    let data_line = lines.next().context("w1_slave has no data line")?;
    let raw = data_line
        .split("t=")
        .nth(1)
        .context("w1_slave data line has no t= field")?
        .trim();
    let milli: i32 = raw
        .parse()
        .with_context(|| format!("bad temperature value '{raw}'"))?;

    match milli {
        POWER_ON_MILLI_C => bail!("probe returned power-on value (85 °C)"),
        DISCONNECTED_MILLI_C => bail!("probe disconnected (-127 °C)"),
        _ => Ok(milli as f32 / 1000.0),
    }
}

// ---------------------------------------------------------------------------
// Sysfs probe
// ---------------------------------------------------------------------------

pub struct Ds18b20 {
    path: PathBuf,
}

impl Ds18b20 {
    /// Use `path` if given, otherwise the first `28-*` device on the bus.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => discover(Path::new(W1_DEVICES))?,
        };
        info!(path = %path.display(), "DS18B20 probe");
        Ok(Self { path })
    }
}

fn discover(bus: &Path) -> Result<PathBuf> {
    let entries = std::fs::read_dir(bus)
        .with_context(|| format!("1-wire bus not available at {}", bus.display()))?;
    let mut devices: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("28-"))
        .map(|e| e.path().join("w1_slave"))
        .collect();
    devices.sort();
    devices
        .into_iter()
        .next()
        .with_context(|| format!("no DS18B20 found under {}", bus.display()))
}

impl TemperatureSource for Ds18b20 {
    fn read_celsius(&mut self) -> Result<f32> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        parse_w1_slave(&contents)
    }
}

/// Stands in for a probe that could not be opened, so the controller keeps
/// running on the fallback temperature.
pub struct Unavailable(pub String);

impl TemperatureSource for Unavailable {
    fn read_celsius(&mut self) -> Result<f32> {
        bail!("temperature probe unavailable: {}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Last-known-value wrapper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeStatus {
    pub temperature_c: f32,
    pub sensor_ok: bool,
    pub last_error: Option<String>,
}

/// Keeps the last good reading so the controller always has a value.
pub struct TemperatureReading {
    source: Box<dyn TemperatureSource>,
    status: ProbeStatus,
}

impl TemperatureReading {
    pub fn new(source: Box<dyn TemperatureSource>) -> Self {
        Self {
            source,
            status: ProbeStatus {
                temperature_c: FALLBACK_TEMPERATURE_C,
                sensor_ok: false,
                last_error: None,
            },
        }
    }

    pub fn celsius(&self) -> f32 {
        self.status.temperature_c
    }

    pub fn status(&self) -> &ProbeStatus {
        &self.status
    }

    /// Read the probe.  On failure the previous value is kept; the failure
    /// is logged once per episode.
    pub fn refresh(&mut self) -> f32 {
        match self.source.read_celsius() {
            Ok(t) => {
                if !self.status.sensor_ok && self.status.last_error.is_some() {
                    info!(temperature_c = t, "temperature probe recovered");
                }
                self.status = ProbeStatus {
                    temperature_c: t,
                    sensor_ok: true,
                    last_error: None,
                };
            }
            Err(e) => {
                if self.status.sensor_ok || self.status.last_error.is_none() {
                    warn!(
                        keep_c = self.status.temperature_c,
                        "temperature read failed: {e:#}"
                    );
                }
                self.status.sensor_ok = false;
                self.status.last_error = Some(format!("{e:#}"));
            }
        }
        self.status.temperature_c
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    struct Scripted(VecDeque<Result<f32>>);

    impl TemperatureSource for Scripted {
        fn read_celsius(&mut self) -> Result<f32> {
            self.0
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parses_good_reading() {
        assert_eq!(parse_w1_slave(GOOD).unwrap(), 23.125);
    }

    #[test]
    fn parses_negative_reading() {
        let s = "ff ff : crc=aa YES\nff ff t=-1500\n";
        assert_eq!(parse_w1_slave(s).unwrap(), -1.5);
    }

    #[test]
    fn crc_failure_rejected() {
        let s = "72 01 : crc=57 NO\n72 01 t=23125\n";
        assert!(format!("{:#}", parse_w1_slave(s).unwrap_err()).contains("CRC"));
    }

    #[test]
    fn sentinels_rejected() {
        assert!(parse_w1_slave("x YES\nx t=85000\n").is_err());
        assert!(parse_w1_slave("x YES\nx t=-127000\n").is_err());
    }

    #[test]
    fn truncated_file_rejected() {
        assert!(parse_w1_slave("").is_err());
        assert!(parse_w1_slave("x YES\n").is_err());
        assert!(parse_w1_slave("x YES\nx t=\n").is_err());
    }

    #[test]
    fn discover_missing_bus_fails() {
        assert!(discover(Path::new("/nonexistent/w1")).is_err());
    }

    // -- Last known value -------------------------------------------------

    #[test]
    fn fallback_before_first_read() {
        let mut reading = TemperatureReading::new(Box::new(Scripted(VecDeque::from([Err(
            anyhow::anyhow!("bus error"),
        )]))));
        assert_eq!(reading.celsius(), FALLBACK_TEMPERATURE_C);
        assert_eq!(reading.refresh(), FALLBACK_TEMPERATURE_C);
        assert!(!reading.status().sensor_ok);
    }

    #[test]
    fn unavailable_probe_stays_on_fallback() {
        let mut reading = TemperatureReading::new(Box::new(Unavailable("no bus".into())));
        assert_eq!(reading.refresh(), FALLBACK_TEMPERATURE_C);
        assert!(reading
            .status()
            .last_error
            .as_deref()
            .unwrap()
            .contains("no bus"));
    }

    #[test]
    fn failure_keeps_last_value() {
        let mut reading = TemperatureReading::new(Box::new(Scripted(VecDeque::from([
            Ok(24.5),
            Err(anyhow::anyhow!("crc")),
            Ok(25.0),
        ]))));
        assert_eq!(reading.refresh(), 24.5);
        assert_eq!(reading.refresh(), 24.5);
        assert_eq!(reading.status().last_error.as_deref(), Some("crc"));
        assert_eq!(reading.refresh(), 25.0);
        assert!(reading.status().sensor_ok);
        assert!(reading.status().last_error.is_none());
    }
}
