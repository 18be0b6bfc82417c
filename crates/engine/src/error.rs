//! Error taxonomy for the control engine.
//!
//! Only `InvalidConfiguration` is fatal, and only at construction time.
//! `InvalidReading` is recovered inside `Engine::tick`; the remaining
//! variants reject operator actions that are not allowed in the current
//! pump phase.

use std::fmt;

use thiserror::Error;

use crate::pump::PumpPhase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid reading: raw moisture {raw} is negative")]
    InvalidReading { raw: i64 },

    #[error("invalid configuration ({0})")]
    InvalidConfiguration(ConfigErrors),

    #[error("pump is locked out while {phase}")]
    Locked { phase: PumpPhase },

    #[error("counter reset requires maintenance mode (pump is {phase})")]
    NotInMaintenance { phase: PumpPhase },

    #[error("no fault to clear (pump is {phase})")]
    NotInError { phase: PumpPhase },
}

/// Every violation found while validating a settings block, not just the
/// first one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(Vec<String>);

impl ConfigErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// `Ok(value)` when nothing was collected.
    pub fn finish<T>(self, value: T) -> Result<T, EngineError> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(EngineError::InvalidConfiguration(self))
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error{}:\n  - {}",
            self.0.len(),
            if self.0.len() == 1 { "" } else { "s" },
            self.0.join("\n  - ")
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
