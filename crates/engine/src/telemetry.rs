//! Values exchanged with the bridge collaborators: the polled sample coming
//! in and the control writes going out.
//!
//! The bridge exposes three virtual pins: `V0` moisture magnitude, `V1`
//! manual pump switch, `V2` automatic mode switch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Virtual pin carrying the raw moisture magnitude.
pub const MOISTURE_PIN: &str = "V0";

/// One polled snapshot of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Raw magnitude from the sensor's analog range (unbounded).
    pub raw_moisture: i64,
    /// Requested manual pump state (`V1`).
    pub manual_flag: bool,
    /// Device-side automatic mode (`V2`).
    pub auto_flag: bool,
    /// Whether the bridge is reachable.
    pub device_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPin {
    ManualControl,
    AutoControl,
}

impl ControlPin {
    pub fn virtual_pin(self) -> &'static str {
        match self {
            Self::ManualControl => "V1",
            Self::AutoControl => "V2",
        }
    }
}

/// A write the command sink forwards to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub pin: ControlPin,
    pub value: bool,
}

impl ControlCommand {
    pub fn new(pin: ControlPin, value: bool) -> Self {
        Self { pin, value }
    }

    /// Bridge payload: `1` or `0`.
    pub fn payload(&self) -> &'static [u8] {
        if self.value {
            b"1"
        } else {
            b"0"
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.pin.virtual_pin(), u8::from(self.value))
    }
}
