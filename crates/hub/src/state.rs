use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use pump_engine::{
    Advisory, ControlCommand, Engine, IrrigationState, MoistureReading, PumpPhase, PumpState,
};

use crate::config::{Config, Settings};
use crate::mqtt::PinCache;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Holding the write lock for the whole of `Engine::tick` keeps ticks
/// strictly sequential.
pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    /// Active settings; every tick reads them under the same lock.
    pub settings: Settings,
    pub engine: Engine,
    pub pins: PinCache,
    pub last: Option<IrrigationState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Command,
    Advisory,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub device_online: bool,
    pub maintenance_requested: bool,
    /// Last V0 magnitude received from the bridge.
    pub raw_moisture: Option<i64>,
    pub reading: Option<MoistureReading>,
    pub pump: PumpState,
    pub advisory: Option<Advisory>,
    pub settings: Config,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            settings,
            engine: Engine::new(),
            pins: PinCache::new(),
            last: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record the outcome of one engine tick. Only changes are logged as
    /// events: classification, phase, connectivity, advisories, commands.
    pub fn record_tick(&mut self, next: IrrigationState, command: Option<&ControlCommand>) {
        let prev = self.last.take();

        let prev_status = prev.as_ref().and_then(|p| p.reading).map(|r| r.status);
        if let Some(r) = next.reading.filter(|r| !r.stale) {
            if prev_status != Some(r.status) {
                self.push_event(
                    EventKind::Reading,
                    format!("moisture {}% ({:?})", r.percent, r.status).to_lowercase(),
                );
            }
        }

        let prev_phase = prev.as_ref().map_or(PumpPhase::Idle, |p| p.pump.phase);
        if prev_phase != next.pump.phase {
            let detail = match (&next.pump.phase, &next.pump.fault) {
                (PumpPhase::Error, Some(fault)) => format!("{prev_phase} -> error: {fault}"),
                (phase, _) => format!("{prev_phase} -> {phase}"),
            };
            self.push_event(EventKind::Pump, detail);
        }

        let was_online = prev.as_ref().map_or(true, |p| p.online);
        if was_online != next.online {
            let detail = if next.online {
                "bridge online"
            } else {
                "bridge offline, holding last reading"
            };
            self.push_event(EventKind::System, detail.to_string());
        }

        let prev_advisory = prev
            .as_ref()
            .and_then(|p| p.advisory)
            .map(|a| std::mem::discriminant(&a));
        if let Some(advisory) = next.advisory {
            if prev_advisory != Some(std::mem::discriminant(&advisory)) {
                self.push_event(EventKind::Advisory, describe_advisory(&advisory));
            }
        }

        if let Some(cmd) = command {
            self.push_event(EventKind::Command, format!("engine issued {cmd}"));
        }

        self.last = Some(next);
    }

    /// Swap in new calibration and pump policy. Applies from the next tick.
    pub fn apply_settings(&mut self, next: Settings) {
        let before = Config::from(&self.settings);
        let after = Config::from(&next);
        self.settings = next;
        if before == after {
            return;
        }

        tracing::info!(
            adc_max = self.settings.calibration.adc_max(),
            moisture_threshold = self.settings.pump.moisture_threshold(),
            max_daily_runs = self.settings.pump.max_daily_runs(),
            "settings updated"
        );
        let mut changed = Vec::new();
        if before.calibration != after.calibration {
            changed.push("calibration");
        }
        if before.pump != after.pump {
            changed.push("pump");
        }
        self.push_event(
            EventKind::System,
            format!("settings updated ({})", changed.join(", ")),
        );
    }

    /// Record a command delivered to the bridge.
    pub fn record_command(&mut self, cmd: &ControlCommand) {
        self.push_event(EventKind::Command, format!("sent {cmd}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot. Pump counters come from
    /// the engine directly so operator resets show up before the next tick.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            device_online: self.last.as_ref().is_some_and(|s| s.online),
            maintenance_requested: self.engine.maintenance_requested(),
            raw_moisture: self.pins.raw_moisture(),
            reading: self.engine.reading().copied(),
            pump: self.engine.pump().clone(),
            advisory: self.last.as_ref().and_then(|s| s.advisory),
            settings: Config::from(&self.settings),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_advisory(advisory: &Advisory) -> String {
    match advisory {
        Advisory::RunLimitReached {
            daily_runs,
            max_daily_runs,
        } => format!("daily run limit reached ({daily_runs}/{max_daily_runs})"),
        Advisory::DurationExceeded {
            running_seconds,
            limit_seconds,
        } => format!("run exceeded pump duration ({running_seconds}s > {limit_seconds}s)"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
