//! Irrigation control engine for one soil moisture sensor and one pump.
//!
//! The engine turns polled bridge telemetry into a calibrated moisture
//! reading, decides whether the pump should run, and advances a pump state
//! machine with safety limits and run statistics. It performs no I/O: a
//! hosting process polls the bridge, calls [`Engine::tick`] once per cycle
//! and forwards any returned [`ControlCommand`].

pub mod arbiter;
pub mod calibration;
pub mod engine;
pub mod error;
pub mod pump;
pub mod telemetry;

pub use arbiter::RunReason;
pub use calibration::{CalibrationConfig, MoistureReading, MoistureStatus};
pub use engine::{Engine, IrrigationState};
pub use error::{ConfigErrors, EngineError};
pub use pump::{Advisory, HistoryEntry, PumpPhase, PumpSettings, PumpState};
pub use telemetry::{ControlCommand, ControlPin, TelemetrySample, MOISTURE_PIN};
