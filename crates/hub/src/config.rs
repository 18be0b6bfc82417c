//! TOML config file loading and validation for calibration, pump policy and
//! the bridge connection.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use pump_engine::{CalibrationConfig, EngineError, PumpSettings};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

/// File shape of the settings. Also the JSON shape of `/api/settings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub calibration: CalibrationEntry,
    pub pump: PumpEntry,
    pub bridge: BridgeEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationEntry {
    pub adc_max: i64,
    pub invert: bool,
    pub dry_threshold: i64,
    pub wet_threshold: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpEntry {
    pub auto_mode: bool,
    pub moisture_threshold: i64,
    pub pump_duration_sec: i64,
    pub max_daily_runs: i64,
    pub power_limit_amps: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeEntry {
    pub device_id: String,
    pub poll_interval_sec: i64,
    pub stale_after_sec: i64,
}

impl Default for CalibrationEntry {
    fn default() -> Self {
        Self {
            adc_max: 1023,
            invert: false,
            dry_threshold: 20,
            wet_threshold: 80,
        }
    }
}

impl Default for PumpEntry {
    fn default() -> Self {
        Self {
            auto_mode: true,
            moisture_threshold: 30,
            pump_duration_sec: 5,
            max_daily_runs: 3,
            power_limit_amps: 5.0,
        }
    }
}

impl Default for BridgeEntry {
    fn default() -> Self {
        Self {
            device_id: "pump-bridge".into(),
            poll_interval_sec: 2,
            stale_after_sec: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub device_id: String,
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

/// Everything the hub needs at runtime. Calibration and pump policy can
/// be replaced while running; the bridge section is fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub calibration: CalibrationConfig,
    pub pump: PumpSettings,
    pub bridge: BridgeSettings,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            device_id: "pump-bridge".into(),
            poll_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Validate replacement calibration and pump sections against the
    /// running bridge section.
    pub fn with_policy(&self, calibration: CalibrationEntry, pump: PumpEntry) -> Result<Settings> {
        let mut config = Config::from(self);
        config.calibration = calibration;
        config.pump = pump;
        config.validate()
    }
}

impl From<&Settings> for Config {
    fn from(s: &Settings) -> Self {
        Self {
            calibration: CalibrationEntry {
                adc_max: i64::from(s.calibration.adc_max()),
                invert: s.calibration.invert(),
                dry_threshold: i64::from(s.calibration.dry_threshold()),
                wet_threshold: i64::from(s.calibration.wet_threshold()),
            },
            pump: PumpEntry {
                auto_mode: s.pump.auto_mode(),
                moisture_threshold: i64::from(s.pump.moisture_threshold()),
                pump_duration_sec: s.pump.pump_duration_seconds() as i64,
                max_daily_runs: i64::from(s.pump.max_daily_runs()),
                power_limit_amps: s.pump.power_limit_amps(),
            },
            bridge: BridgeEntry {
                device_id: s.bridge.device_id.clone(),
                poll_interval_sec: s.bridge.poll_interval.as_secs() as i64,
                stale_after_sec: s.bridge.stale_after.as_secs() as i64,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns the runtime settings or an error
    /// describing every violation found (not just the first one).
    pub fn validate(&self) -> Result<Settings> {
        let mut errors: Vec<String> = Vec::new();

        let c = &self.calibration;
        let calibration = collect(
            "calibration",
            CalibrationConfig::new(c.adc_max, c.invert, c.dry_threshold, c.wet_threshold),
            &mut errors,
        );

        let p = &self.pump;
        let pump = collect(
            "pump",
            PumpSettings::new(
                p.auto_mode,
                p.moisture_threshold,
                p.pump_duration_sec,
                p.max_daily_runs,
                p.power_limit_amps,
            ),
            &mut errors,
        );

        let bridge = self.validate_bridge(&mut errors);

        match (calibration, pump, bridge) {
            (Some(calibration), Some(pump), Some(bridge)) if errors.is_empty() => Ok(Settings {
                calibration,
                pump,
                bridge,
            }),
            _ => bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            ),
        }
    }

    fn validate_bridge(&self, errors: &mut Vec<String>) -> Option<BridgeSettings> {
        let b = &self.bridge;
        let before = errors.len();

        if b.device_id.trim().is_empty() {
            errors.push("bridge: device_id is empty".into());
        } else if b.device_id.contains(&['/', '+', '#'][..]) {
            errors.push(format!(
                "bridge: device_id '{}' must not contain MQTT topic characters",
                b.device_id
            ));
        }
        if b.poll_interval_sec <= 0 {
            errors.push(format!(
                "bridge: poll_interval_sec must be positive, got {}",
                b.poll_interval_sec
            ));
        }
        if b.stale_after_sec <= 0 {
            errors.push(format!(
                "bridge: stale_after_sec must be positive, got {}",
                b.stale_after_sec
            ));
        } else if b.poll_interval_sec > 0 && b.stale_after_sec < b.poll_interval_sec {
            errors.push(format!(
                "bridge: stale_after_sec ({}) is shorter than poll_interval_sec ({})",
                b.stale_after_sec, b.poll_interval_sec
            ));
        }

        (errors.len() == before).then(|| BridgeSettings {
            device_id: b.device_id.clone(),
            poll_interval: Duration::from_secs(b.poll_interval_sec as u64),
            stale_after: Duration::from_secs(b.stale_after_sec as u64),
        })
    }
}

/// Fold an engine validation result into the shared error list.
fn collect<T>(section: &str, result: Result<T, EngineError>, errors: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(EngineError::InvalidConfiguration(found)) => {
            errors.extend(found.iter().map(|e| format!("{section}: {e}")));
            None
        }
        Err(other) => {
            errors.push(format!("{section}: {other}"));
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// "use the defaults".
pub fn load(path: &str) -> Result<Settings> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Config::default()
            .validate()
            .context("default config is invalid");
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    let settings = config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        path,
        device_id = %settings.bridge.device_id,
        adc_max = settings.calibration.adc_max(),
        moisture_threshold = settings.pump.moisture_threshold(),
        max_daily_runs = settings.pump.max_daily_runs(),
        "config loaded"
    );

    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
