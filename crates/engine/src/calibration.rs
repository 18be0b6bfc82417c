//! Calibration mapper: raw sensor magnitude to a 0–100 moisture percentage
//! and a dry/optimal/wet classification.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{ConfigErrors, EngineError};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Validated calibration parameters. Construct with [`CalibrationConfig::new`];
/// an instance always satisfies `dry_threshold < wet_threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalibrationConfig {
    adc_max: u32,
    invert: bool,
    dry_threshold: u8,
    wet_threshold: u8,
}

impl CalibrationConfig {
    pub fn new(
        adc_max: i64,
        invert: bool,
        dry_threshold: i64,
        wet_threshold: i64,
    ) -> Result<Self, EngineError> {
        let mut errors = ConfigErrors::new();

        if adc_max <= 0 || adc_max > i64::from(u32::MAX) {
            errors.push(format!(
                "adc_max {adc_max} out of range [1, {}]",
                u32::MAX
            ));
        }
        if !(0..=100).contains(&dry_threshold) {
            errors.push(format!(
                "dry_threshold {dry_threshold} out of range [0, 100]"
            ));
        }
        if !(0..=100).contains(&wet_threshold) {
            errors.push(format!(
                "wet_threshold {wet_threshold} out of range [0, 100]"
            ));
        }
        if dry_threshold >= wet_threshold {
            errors.push(format!(
                "dry_threshold ({dry_threshold}) must be less than wet_threshold ({wet_threshold})"
            ));
        }

        errors.finish(())?;
        Ok(Self {
            adc_max: adc_max as u32,
            invert,
            dry_threshold: dry_threshold as u8,
            wet_threshold: wet_threshold as u8,
        })
    }

    pub fn adc_max(&self) -> u32 {
        self.adc_max
    }

    pub fn invert(&self) -> bool {
        self.invert
    }

    pub fn dry_threshold(&self) -> u8 {
        self.dry_threshold
    }

    pub fn wet_threshold(&self) -> u8 {
        self.wet_threshold
    }
}

impl Default for CalibrationConfig {
    /// 10-bit ADC, non-inverted, 20 % / 80 % thresholds.
    fn default() -> Self {
        Self {
            adc_max: 1023,
            invert: false,
            dry_threshold: 20,
            wet_threshold: 80,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoistureStatus {
    Dry,
    Optimal,
    Wet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoistureReading {
    pub percent: u8,
    pub status: MoistureStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
    /// Retained from an earlier sample because the latest one was unusable.
    pub stale: bool,
}

impl MoistureReading {
    pub fn into_stale(self) -> Self {
        Self {
            stale: true,
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------------------

/// Map a raw magnitude to a fresh reading observed at `now`.
///
/// Raw values above `adc_max` saturate at 100 % (or 0 % when inverted).
/// Negative magnitudes are rejected with [`EngineError::InvalidReading`].
pub fn map(
    raw: i64,
    cfg: &CalibrationConfig,
    now: OffsetDateTime,
) -> Result<MoistureReading, EngineError> {
    if raw < 0 {
        return Err(EngineError::InvalidReading { raw });
    }

    let adc_max = i64::from(cfg.adc_max.max(1));
    let mapped = if cfg.invert {
        (adc_max - raw).max(0)
    } else {
        raw
    };
    let percent = ((mapped as f64 / adc_max as f64) * 100.0)
        .round()
        .clamp(0.0, 100.0) as u8;

    Ok(MoistureReading {
        percent,
        status: classify(percent, cfg),
        observed_at: now,
        stale: false,
    })
}

fn classify(percent: u8, cfg: &CalibrationConfig) -> MoistureStatus {
    if percent < cfg.dry_threshold {
        MoistureStatus::Dry
    } else if percent > cfg.wet_threshold {
        MoistureStatus::Wet
    } else {
        MoistureStatus::Optimal
    }
}

// ===========================================================================
// Tests
// ===========================================================================
