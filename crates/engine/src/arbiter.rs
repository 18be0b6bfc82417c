//! Mode arbiter: should the pump run right now?
//!
//! Stateless and re-evaluated every tick. The device-reported auto flag
//! governs; the locally held `PumpSettings::auto_mode` is advisory only.

use serde::Serialize;

use crate::calibration::MoistureReading;
use crate::pump::PumpSettings;
use crate::telemetry::TelemetrySample;

/// Why a run was started, recorded in the pump history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    AutoLowMoisture,
    Manual,
}

/// Auto mode runs while moisture is below the threshold; manual mode follows
/// the manual flag. Without any reading yet, auto mode never runs.
pub fn decide(
    reading: Option<&MoistureReading>,
    sample: &TelemetrySample,
    settings: &PumpSettings,
) -> bool {
    if sample.auto_flag {
        reading.is_some_and(|r| r.percent < settings.moisture_threshold())
    } else {
        sample.manual_flag
    }
}

pub fn reason(sample: &TelemetrySample) -> RunReason {
    if sample.auto_flag {
        RunReason::AutoLowMoisture
    } else {
        RunReason::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::MoistureStatus;
    use time::macros::datetime;

    fn reading(percent: u8) -> MoistureReading {
        MoistureReading {
            percent,
            status: MoistureStatus::Optimal,
            observed_at: datetime!(2024-05-01 12:00 UTC),
            stale: false,
        }
    }

    fn sample(auto_flag: bool, manual_flag: bool) -> TelemetrySample {
        TelemetrySample {
            raw_moisture: 0,
            manual_flag,
            auto_flag,
            device_online: true,
        }
    }

    fn settings(threshold: i64) -> PumpSettings {
        PumpSettings::new(true, threshold, 5, 3, 5.0).unwrap()
    }

    // -- Auto mode ----------------------------------------------------------

    #[test]
    fn auto_runs_below_threshold() {
        assert!(decide(Some(&reading(20)), &sample(true, false), &settings(30)));
    }

    #[test]
    fn auto_does_not_run_at_threshold() {
        assert!(!decide(Some(&reading(30)), &sample(true, false), &settings(30)));
    }

    #[test]
    fn auto_ignores_manual_flag() {
        assert!(!decide(Some(&reading(80)), &sample(true, true), &settings(30)));
    }

    #[test]
    fn auto_without_reading_does_not_run() {
        assert!(!decide(None, &sample(true, true), &settings(30)));
    }

    #[test]
    fn device_auto_flag_overrides_local_setting() {
        let local_manual = PumpSettings::new(false, 30, 5, 3, 5.0).unwrap();
        assert!(decide(Some(&reading(10)), &sample(true, false), &local_manual));
    }

    #[test]
    fn stale_reading_still_drives_auto() {
        let r = reading(10).into_stale();
        assert!(decide(Some(&r), &sample(true, false), &settings(30)));
    }

    // -- Manual mode --------------------------------------------------------

    #[test]
    fn manual_off_never_runs() {
        assert!(!decide(Some(&reading(0)), &sample(false, false), &settings(30)));
    }

    #[test]
    fn manual_on_runs_regardless_of_moisture() {
        assert!(decide(Some(&reading(100)), &sample(false, true), &settings(30)));
        assert!(decide(None, &sample(false, true), &settings(30)));
    }

    #[test]
    fn reason_follows_auto_flag() {
        assert_eq!(reason(&sample(true, false)), RunReason::AutoLowMoisture);
        assert_eq!(reason(&sample(false, true)), RunReason::Manual);
    }
}
