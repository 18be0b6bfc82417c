//! Reconciliation engine: one synchronous `tick` per telemetry poll.
//!
//! validate sample → map reading (keep last known good on failure) →
//! arbitrate → advance the pump machine → assemble `IrrigationState`.
//!
//! Ticks must be strictly sequential; the caller owns scheduling and all I/O.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::arbiter;
use crate::calibration::{self, CalibrationConfig, MoistureReading};
use crate::error::EngineError;
use crate::pump::{Advisory, PumpInput, PumpMachine, PumpPhase, PumpSettings, PumpState};
use crate::telemetry::{ControlCommand, ControlPin, TelemetrySample};

/// Snapshot handed to clients after every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationState {
    /// Latest classification; `None` until the first valid sample.
    pub reading: Option<MoistureReading>,
    pub pump: PumpState,
    pub online: bool,
    pub advisory: Option<Advisory>,
}

#[derive(Debug, Default)]
pub struct Engine {
    machine: PumpMachine,
    reading: Option<MoistureReading>,
    maintenance_requested: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(
        &mut self,
        sample: &TelemetrySample,
        now: OffsetDateTime,
        elapsed_secs: u64,
        cfg: &CalibrationConfig,
        settings: &PumpSettings,
    ) -> (IrrigationState, Option<ControlCommand>) {
        self.reading = self.classify(sample, now, cfg);

        // Offline: hold whatever the pump was last doing.
        let desired_running = if sample.device_online {
            arbiter::decide(self.reading.as_ref(), sample, settings)
        } else {
            self.machine.state().running
        };

        let input = PumpInput {
            desired_running,
            reason: arbiter::reason(sample),
            auto_flag: sample.auto_flag,
            now,
            elapsed_secs,
            maintenance_requested: self.maintenance_requested,
        };
        let result = self.machine.advance(&input, settings);

        if let Some(cmd) = &result.command {
            info!(command = %cmd, phase = %result.state.phase, "engine: stop command issued");
        }

        let state = IrrigationState {
            reading: self.reading,
            pump: result.state,
            online: sample.device_online,
            advisory: result.advisory,
        };
        (state, result.command)
    }

    fn classify(
        &self,
        sample: &TelemetrySample,
        now: OffsetDateTime,
        cfg: &CalibrationConfig,
    ) -> Option<MoistureReading> {
        if !sample.device_online {
            debug!("engine: device offline, keeping last reading");
            return self.reading.map(MoistureReading::into_stale);
        }
        match calibration::map(sample.raw_moisture, cfg, now) {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(raw = sample.raw_moisture, "engine: ignoring sample: {e}");
                self.reading.map(MoistureReading::into_stale)
            }
        }
    }

    pub fn pump(&self) -> &PumpState {
        self.machine.state()
    }

    pub fn reading(&self) -> Option<&MoistureReading> {
        self.reading.as_ref()
    }

    pub fn maintenance_requested(&self) -> bool {
        self.maintenance_requested
    }

    // -----------------------------------------------------------------------
    // Operator actions
    // -----------------------------------------------------------------------

    /// Takes effect on the next tick.
    pub fn set_maintenance(&mut self, on: bool) {
        if self.maintenance_requested != on {
            info!(on, "engine: maintenance requested");
        }
        self.maintenance_requested = on;
    }

    pub fn reset_daily_runs(&mut self) {
        self.machine.reset_daily_runs();
    }

    pub fn maintenance_reset(&mut self) -> Result<(), EngineError> {
        self.machine.maintenance_reset()
    }

    pub fn clear_error(&mut self) -> Result<(), EngineError> {
        self.machine.clear_error()
    }

    /// Report that `cmd` never reached the bridge.
    pub fn command_failed(&mut self, cmd: &ControlCommand) {
        self.machine.command_failed(cmd);
    }

    /// Force the pump into `Error`. The stop command follows on the next
    /// tick if the hardware is still running.
    pub fn trip(&mut self, reason: impl Into<String>, now: OffsetDateTime) {
        self.machine.trip(reason, now);
    }

    /// Manual pump switch. Switching on is refused while locked out.
    pub fn request_manual(&self, on: bool) -> Result<ControlCommand, EngineError> {
        self.request(ControlPin::ManualControl, on)
    }

    /// Device auto mode. Enabling it is refused while locked out.
    pub fn request_auto(&self, on: bool) -> Result<ControlCommand, EngineError> {
        self.request(ControlPin::AutoControl, on)
    }

    fn request(&self, pin: ControlPin, on: bool) -> Result<ControlCommand, EngineError> {
        let phase = self.machine.phase();
        if on && matches!(phase, PumpPhase::Maintenance | PumpPhase::Error) {
            return Err(EngineError::Locked { phase });
        }
        Ok(ControlCommand::new(pin, on))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::MoistureStatus;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-05-01 06:00 UTC);

    fn at(secs: i64) -> OffsetDateTime {
        T0 + Duration::seconds(secs)
    }

    fn cfg() -> CalibrationConfig {
        CalibrationConfig::new(1023, false, 25, 70).unwrap()
    }

    fn sample(raw_moisture: i64, auto_flag: bool, manual_flag: bool) -> TelemetrySample {
        TelemetrySample {
            raw_moisture,
            manual_flag,
            auto_flag,
            device_online: true,
        }
    }

    fn offline(s: TelemetrySample) -> TelemetrySample {
        TelemetrySample {
            device_online: false,
            ..s
        }
    }

    // -- Full pipeline ------------------------------------------------------

    #[test]
    fn dry_soil_in_auto_starts_pump() {
        let mut e = Engine::new();
        // 200 / 1023 ≈ 20 % < threshold 30
        let (st, cmd) = e.tick(&sample(200, true, false), at(0), 0, &cfg(), &PumpSettings::default());

        let reading = st.reading.unwrap();
        assert_eq!(reading.percent, 20);
        assert_eq!(reading.status, MoistureStatus::Dry);
        assert_eq!(st.pump.phase, PumpPhase::Running);
        assert!(st.online);
        assert!(cmd.is_none());
    }

    #[test]
    fn wet_soil_in_auto_stops_pump() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        e.tick(&sample(200, true, false), at(0), 0, &cfg(), &s);
        e.tick(&sample(200, true, false), at(2), 2, &cfg(), &s);
        let (st, _) = e.tick(&sample(900, true, false), at(4), 2, &cfg(), &s);

        assert_eq!(st.pump.phase, PumpPhase::Idle);
        assert_eq!(st.pump.total_runtime_seconds, 2);
        assert_eq!(st.pump.history[0].duration_seconds, 4);
    }

    #[test]
    fn manual_flag_off_never_runs() {
        let mut e = Engine::new();
        let (st, _) = e.tick(&sample(0, false, false), at(0), 0, &cfg(), &PumpSettings::default());
        assert_eq!(st.pump.phase, PumpPhase::Idle);
    }

    // -- Idempotence --------------------------------------------------------

    #[test]
    fn repeated_identical_tick_is_idempotent() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        let smp = sample(100, true, false);

        let (first, _) = e.tick(&smp, at(10), 0, &cfg(), &s);
        let (second, cmd) = e.tick(&smp, at(10), 0, &cfg(), &s);
        assert_eq!(first, second);
        assert!(cmd.is_none());
    }

    // -- Stale handling -----------------------------------------------------

    #[test]
    fn invalid_sample_keeps_last_reading_stale() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        let (first, _) = e.tick(&sample(600, true, false), at(0), 0, &cfg(), &s);
        let (st, _) = e.tick(&sample(-3, true, false), at(2), 2, &cfg(), &s);

        let kept = st.reading.unwrap();
        assert!(kept.stale);
        assert_eq!(kept.percent, first.reading.unwrap().percent);
        assert_eq!(kept.observed_at, at(0));
        assert!(st.online);
    }

    #[test]
    fn invalid_first_sample_has_no_reading() {
        let mut e = Engine::new();
        let (st, _) = e.tick(&sample(-1, true, false), at(0), 0, &cfg(), &PumpSettings::default());
        assert!(st.reading.is_none());
        assert_eq!(st.pump.phase, PumpPhase::Idle);
    }

    #[test]
    fn offline_keeps_classification_and_pump_state() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        e.tick(&sample(100, true, false), at(0), 0, &cfg(), &s);

        // Offline sample claims wet soil and auto off; neither is trusted.
        let (st, _) = e.tick(&offline(sample(1000, false, false)), at(2), 2, &cfg(), &s);
        assert!(!st.online);
        let r = st.reading.unwrap();
        assert!(r.stale);
        assert_eq!(r.percent, 10);
        assert_eq!(st.pump.phase, PumpPhase::Running);
        assert_eq!(st.pump.total_runtime_seconds, 2);
    }

    #[test]
    fn offline_while_idle_stays_idle() {
        let mut e = Engine::new();
        let (st, _) = e.tick(&offline(sample(0, false, true)), at(0), 0, &cfg(), &PumpSettings::default());
        assert_eq!(st.pump.phase, PumpPhase::Idle);
        assert!(st.reading.is_none());
    }

    // -- Run limit ----------------------------------------------------------

    #[test]
    fn run_limit_reported_in_state() {
        let mut e = Engine::new();
        let s = PumpSettings::new(true, 30, 5, 1, 5.0).unwrap();
        e.tick(&sample(0, false, true), at(0), 0, &cfg(), &s);
        e.tick(&sample(0, false, false), at(2), 2, &cfg(), &s);
        let (st, cmd) = e.tick(&sample(0, false, true), at(4), 2, &cfg(), &s);

        assert_eq!(st.pump.phase, PumpPhase::Idle);
        assert!(matches!(st.advisory, Some(Advisory::RunLimitReached { .. })));
        assert!(cmd.is_none());
    }

    // -- Maintenance --------------------------------------------------------

    #[test]
    fn maintenance_applies_on_next_tick_and_stops_pump() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        e.tick(&sample(0, false, true), at(0), 0, &cfg(), &s);

        e.set_maintenance(true);
        let (st, cmd) = e.tick(&sample(0, false, true), at(2), 2, &cfg(), &s);
        assert_eq!(st.pump.phase, PumpPhase::Maintenance);
        assert_eq!(
            cmd,
            Some(ControlCommand::new(ControlPin::ManualControl, false))
        );

        e.set_maintenance(false);
        let (st, _) = e.tick(&sample(0, false, true), at(4), 2, &cfg(), &s);
        assert_eq!(st.pump.phase, PumpPhase::Idle);
    }

    #[test]
    fn maintenance_reset_through_engine() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        e.tick(&sample(0, false, true), at(0), 0, &cfg(), &s);
        e.tick(&sample(0, false, true), at(2), 2, &cfg(), &s);
        assert!(e.maintenance_reset().is_err());

        e.set_maintenance(true);
        e.tick(&sample(0, false, false), at(4), 2, &cfg(), &s);
        e.maintenance_reset().unwrap();
        assert_eq!(e.pump().total_runtime_seconds, 0);
        assert_eq!(e.pump().daily_runs, 0);
        assert_eq!(e.pump().history.len(), 1);
    }

    // -- Faults -------------------------------------------------------------

    #[test]
    fn trip_stops_auto_pump_through_auto_pin() {
        let mut e = Engine::new();
        let s = PumpSettings::default();
        e.tick(&sample(100, true, false), at(0), 0, &cfg(), &s);

        e.trip("operator emergency stop", at(1));
        let (st, cmd) = e.tick(&sample(100, true, false), at(2), 2, &cfg(), &s);
        assert_eq!(st.pump.phase, PumpPhase::Error);
        assert_eq!(cmd, Some(ControlCommand::new(ControlPin::AutoControl, false)));
        assert!(e.request_auto(true).is_err());

        e.clear_error().unwrap();
        let (st, cmd) = e.tick(&sample(100, true, false), at(4), 2, &cfg(), &s);
        assert_eq!(st.pump.phase, PumpPhase::Running);
        assert!(cmd.is_none());
    }

    // -- Operator requests --------------------------------------------------

    #[test]
    fn requests_build_commands_when_healthy() {
        let e = Engine::new();
        assert_eq!(
            e.request_manual(true),
            Ok(ControlCommand::new(ControlPin::ManualControl, true))
        );
        assert_eq!(
            e.request_auto(false),
            Ok(ControlCommand::new(ControlPin::AutoControl, false))
        );
    }

    #[test]
    fn switching_on_refused_while_locked_out() {
        let mut e = Engine::new();
        e.set_maintenance(true);
        e.tick(&sample(500, false, false), at(0), 0, &cfg(), &PumpSettings::default());

        assert_eq!(
            e.request_manual(true),
            Err(EngineError::Locked {
                phase: PumpPhase::Maintenance
            })
        );
        assert!(e.request_auto(true).is_err());
        // Switching off is always allowed.
        assert!(e.request_manual(false).is_ok());
        assert!(e.request_auto(false).is_ok());
    }

    #[test]
    fn state_serializes_for_clients() {
        let mut e = Engine::new();
        let (st, _) = e.tick(&sample(1023, true, false), at(0), 0, &cfg(), &PumpSettings::default());
        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["reading"]["percent"], 100);
        assert_eq!(json["reading"]["status"], "wet");
        assert_eq!(json["pump"]["phase"], "idle");
        assert_eq!(json["online"], true);
        assert!(json["advisory"].is_null());
    }
}
