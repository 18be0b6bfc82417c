//! Pump state machine: applies the arbiter's decision under the safety
//! limits and keeps runtime, run counts, power estimate and run history.
//!
//! ```text
//!          ┌──[desired, runs < max]──▶ Running ──[!desired]──┐
//!  Idle ◀──┘                              │                  │
//!   ▲ ▲                                   │ [maintenance]    │
//!   │ └───────────────────────────────────┼──────────────────┘
//!   │                                     ▼
//!   └──[maintenance cleared]────── Maintenance ◀──[maintenance]── Idle
//!
//!  Idle ──[desired, draw > power limit]──▶ Error ──[clear_error]──▶ Idle
//!  any  ──[trip]──────────────────────────▶ Error
//! ```
//!
//! Leaving maintenance always lands in `Idle`; a run can only start on a
//! later tick. The run limit only governs this machine's own bookkeeping:
//! it never commands the hardware off.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::arbiter::RunReason;
use crate::error::{ConfigErrors, EngineError};
use crate::telemetry::{ControlCommand, ControlPin};

/// Completed and pending runs retained, newest first.
pub const HISTORY_CAPACITY: usize = 10;

/// Estimated current draw while the pump runs.
pub const RUNNING_DRAW_AMPS: f64 = 2.5;
/// Estimated standby draw of the controller.
pub const IDLE_DRAW_AMPS: f64 = 0.5;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Validated pump policy. Construct with [`PumpSettings::new`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpSettings {
    auto_mode: bool,
    moisture_threshold: u8,
    pump_duration_seconds: u64,
    max_daily_runs: u32,
    power_limit_amps: f64,
}

impl PumpSettings {
    pub fn new(
        auto_mode: bool,
        moisture_threshold: i64,
        pump_duration_seconds: i64,
        max_daily_runs: i64,
        power_limit_amps: f64,
    ) -> Result<Self, EngineError> {
        let mut errors = ConfigErrors::new();

        if !(0..=100).contains(&moisture_threshold) {
            errors.push(format!(
                "moisture_threshold {moisture_threshold} out of range [0, 100]"
            ));
        }
        if pump_duration_seconds <= 0 {
            errors.push(format!(
                "pump_duration_seconds must be positive, got {pump_duration_seconds}"
            ));
        }
        if max_daily_runs <= 0 || max_daily_runs > i64::from(u32::MAX) {
            errors.push(format!(
                "max_daily_runs {max_daily_runs} out of range [1, {}]",
                u32::MAX
            ));
        }
        if !power_limit_amps.is_finite() || power_limit_amps <= 0.0 {
            errors.push(format!(
                "power_limit_amps must be positive, got {power_limit_amps}"
            ));
        }

        errors.finish(())?;
        Ok(Self {
            auto_mode,
            moisture_threshold: moisture_threshold as u8,
            pump_duration_seconds: pump_duration_seconds as u64,
            max_daily_runs: max_daily_runs as u32,
            power_limit_amps,
        })
    }

    /// Operator preference shown to clients; the device's own auto flag
    /// decides at runtime.
    pub fn auto_mode(&self) -> bool {
        self.auto_mode
    }

    pub fn moisture_threshold(&self) -> u8 {
        self.moisture_threshold
    }

    pub fn pump_duration_seconds(&self) -> u64 {
        self.pump_duration_seconds
    }

    pub fn max_daily_runs(&self) -> u32 {
        self.max_daily_runs
    }

    pub fn power_limit_amps(&self) -> f64 {
        self.power_limit_amps
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            auto_mode: true,
            moisture_threshold: 30,
            pump_duration_seconds: 5,
            max_daily_runs: 3,
            power_limit_amps: 5.0,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpPhase {
    Idle,
    Running,
    Maintenance,
    Error,
}

impl fmt::Display for PumpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Maintenance => write!(f, "maintenance"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// `None` while the run is still in progress.
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub duration_seconds: u64,
    pub reason: RunReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpState {
    pub phase: PumpPhase,
    pub running: bool,
    pub total_runtime_seconds: u64,
    pub daily_runs: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_started_at: Option<OffsetDateTime>,
    pub power_draw_amps: f64,
    pub history: VecDeque<HistoryEntry>,
    /// Why the machine entered `Error`.
    pub fault: Option<String>,
}

impl PumpState {
    fn new() -> Self {
        Self {
            phase: PumpPhase::Idle,
            running: false,
            total_runtime_seconds: 0,
            daily_runs: 0,
            last_run_started_at: None,
            power_draw_amps: IDLE_DRAW_AMPS,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            fault: None,
        }
    }
}

/// Non-fatal conditions reported upward for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// A start was requested but today's run budget is spent.
    RunLimitReached { daily_runs: u32, max_daily_runs: u32 },
    /// The current run has lasted longer than the configured pump duration.
    DurationExceeded { running_seconds: u64, limit_seconds: u64 },
}

// ---------------------------------------------------------------------------
// Transition input / output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpInput {
    pub desired_running: bool,
    pub reason: RunReason,
    /// Device-side auto flag; selects which pin a forced stop is written to.
    pub auto_flag: bool,
    pub now: OffsetDateTime,
    /// Seconds since the previous tick, supplied by the caller.
    pub elapsed_secs: u64,
    pub maintenance_requested: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PumpTransitionResult {
    pub state: PumpState,
    pub advisory: Option<Advisory>,
    pub command: Option<ControlCommand>,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PumpMachine {
    state: PumpState,
    last_command: Option<ControlCommand>,
    /// Set after the first refused start so a capped pump logs once.
    limit_logged: bool,
}

impl PumpMachine {
    pub fn new() -> Self {
        Self {
            state: PumpState::new(),
            last_command: None,
            limit_logged: false,
        }
    }

    pub fn state(&self) -> &PumpState {
        &self.state
    }

    pub fn phase(&self) -> PumpPhase {
        self.state.phase
    }

    /// Apply one tick. Rules are evaluated in order: maintenance entry,
    /// maintenance exit, start, stop, keep running.
    pub fn advance(&mut self, input: &PumpInput, settings: &PumpSettings) -> PumpTransitionResult {
        let mut advisory = None;

        match (self.state.phase, input.maintenance_requested) {
            // Faults stay latched until cleared explicitly.
            (PumpPhase::Error, _) => {}
            (PumpPhase::Maintenance, true) => {}
            (PumpPhase::Maintenance, false) => {
                self.state.phase = PumpPhase::Idle;
                info!("pump: maintenance finished, idle");
            }
            (phase, true) => {
                if phase == PumpPhase::Running {
                    self.close_run(input.now);
                }
                self.state.phase = PumpPhase::Maintenance;
                info!(from = %phase, "pump: entering maintenance");
            }
            (PumpPhase::Idle, false) => {
                if input.desired_running {
                    advisory = self.start_run(input, settings);
                }
            }
            (PumpPhase::Running, false) => {
                if input.desired_running {
                    self.state.total_runtime_seconds = self
                        .state
                        .total_runtime_seconds
                        .saturating_add(input.elapsed_secs);
                    advisory = self.check_duration(input.now, settings);
                } else {
                    self.close_run(input.now);
                    self.state.phase = PumpPhase::Idle;
                    info!(
                        total_runtime_sec = self.state.total_runtime_seconds,
                        "pump: stopped"
                    );
                }
            }
        }

        self.refresh_derived();
        let command = self.reconcile_command(input);

        PumpTransitionResult {
            state: self.state.clone(),
            advisory,
            command,
        }
    }

    /// Day rollover: the run budget starts over.
    pub fn reset_daily_runs(&mut self) {
        info!(daily_runs = self.state.daily_runs, "pump: daily runs reset");
        self.state.daily_runs = 0;
        self.limit_logged = false;
    }

    /// Clear the counters after servicing. History is kept.
    pub fn maintenance_reset(&mut self) -> Result<(), EngineError> {
        if self.state.phase != PumpPhase::Maintenance {
            return Err(EngineError::NotInMaintenance {
                phase: self.state.phase,
            });
        }
        info!(
            daily_runs = self.state.daily_runs,
            total_runtime_sec = self.state.total_runtime_seconds,
            "pump: counters reset"
        );
        self.state.daily_runs = 0;
        self.state.total_runtime_seconds = 0;
        self.limit_logged = false;
        Ok(())
    }

    /// The sink could not deliver `cmd`. Forget it so the next locked-out
    /// tick with the hardware still running issues it again.
    pub fn command_failed(&mut self, cmd: &ControlCommand) {
        if self.last_command.as_ref() == Some(cmd) {
            self.last_command = None;
        }
    }

    /// Latch a fault raised outside the machine. A run in progress is cut
    /// short at `now`. The first fault wins until it is cleared.
    pub fn trip(&mut self, reason: impl Into<String>, now: OffsetDateTime) {
        let reason = reason.into();
        if self.state.phase == PumpPhase::Error {
            warn!(%reason, fault = ?self.state.fault, "pump: already faulted, ignoring trip");
            return;
        }
        if self.state.phase == PumpPhase::Running {
            self.close_run(now);
        }
        warn!(from = %self.state.phase, %reason, "pump: tripped");
        self.state.phase = PumpPhase::Error;
        self.state.fault = Some(reason);
        self.refresh_derived();
    }

    pub fn clear_error(&mut self) -> Result<(), EngineError> {
        if self.state.phase != PumpPhase::Error {
            return Err(EngineError::NotInError {
                phase: self.state.phase,
            });
        }
        info!(fault = ?self.state.fault, "pump: fault cleared");
        self.state.phase = PumpPhase::Idle;
        self.state.fault = None;
        self.last_command = None;
        self.refresh_derived();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transition helpers
    // -----------------------------------------------------------------------

    fn start_run(&mut self, input: &PumpInput, settings: &PumpSettings) -> Option<Advisory> {
        if self.state.daily_runs >= settings.max_daily_runs() {
            if !self.limit_logged {
                warn!(
                    daily_runs = self.state.daily_runs,
                    max_daily_runs = settings.max_daily_runs(),
                    "pump: daily run limit reached, not counting start"
                );
                self.limit_logged = true;
            }
            return Some(Advisory::RunLimitReached {
                daily_runs: self.state.daily_runs,
                max_daily_runs: settings.max_daily_runs(),
            });
        }

        if RUNNING_DRAW_AMPS > settings.power_limit_amps() {
            let fault = format!(
                "running draw {RUNNING_DRAW_AMPS}A exceeds power limit {}A",
                settings.power_limit_amps()
            );
            warn!(%fault, "pump: refusing start");
            self.state.phase = PumpPhase::Error;
            self.state.fault = Some(fault);
            return None;
        }

        self.state.phase = PumpPhase::Running;
        self.state.daily_runs += 1;
        self.state.last_run_started_at = Some(input.now);
        self.state.history.push_front(HistoryEntry {
            started_at: input.now,
            ended_at: None,
            duration_seconds: 0,
            reason: input.reason,
        });
        self.state.history.truncate(HISTORY_CAPACITY);

        info!(
            reason = ?input.reason,
            daily_runs = self.state.daily_runs,
            "pump: started"
        );
        None
    }

    /// Close the pending history entry, if any.
    fn close_run(&mut self, now: OffsetDateTime) {
        if let Some(entry) = self
            .state
            .history
            .front_mut()
            .filter(|e| e.ended_at.is_none())
        {
            entry.ended_at = Some(now);
            entry.duration_seconds = (now - entry.started_at).whole_seconds().max(0) as u64;
        }
    }

    fn check_duration(&self, now: OffsetDateTime, settings: &PumpSettings) -> Option<Advisory> {
        let started = self.state.last_run_started_at?;
        let running_seconds = (now - started).whole_seconds().max(0) as u64;
        (running_seconds > settings.pump_duration_seconds()).then_some(Advisory::DurationExceeded {
            running_seconds,
            limit_seconds: settings.pump_duration_seconds(),
        })
    }

    fn refresh_derived(&mut self) {
        self.state.running = self.state.phase == PumpPhase::Running;
        self.state.power_draw_amps = if self.state.running {
            RUNNING_DRAW_AMPS
        } else {
            IDLE_DRAW_AMPS
        };
    }

    /// While locked out, a pump the hardware still drives must be stopped.
    /// Outside a lockout the hardware governs itself and no command is sent.
    fn reconcile_command(&mut self, input: &PumpInput) -> Option<ControlCommand> {
        let locked = matches!(self.state.phase, PumpPhase::Maintenance | PumpPhase::Error);
        if !locked {
            self.last_command = None;
            return None;
        }
        if !input.desired_running {
            // The hardware obeyed; switching back on needs a fresh stop.
            self.last_command = None;
            return None;
        }

        let pin = if input.auto_flag {
            ControlPin::AutoControl
        } else {
            ControlPin::ManualControl
        };
        let command = ControlCommand::new(pin, false);
        if self.last_command == Some(command) {
            return None;
        }
        self.last_command = Some(command);
        Some(command)
    }
}

impl Default for PumpMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
