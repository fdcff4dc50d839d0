//! Error simulation on commands.
//!
//! A filter sits between the control points of a setup and its backend, making a
//! simulated specimen see the tracking error a real actuator would add.
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalFilter {
    /// The actuator stops `error` short of every move.
    Undershoot { error: f64 },
}

impl SignalFilter {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match *self {
            Self::Undershoot { error } if !(error.is_finite() && error >= 0.0) => {
                Err(ConfigurationError::Invalid(format!(
                    "undershoot must be finite and non-negative, got {error}"
                )))
            }
            Self::Undershoot { .. } => Ok(()),
        }
    }

    /// Filters `command`, a move away from `reference`.
    ///
    /// The reference is the last committed command, so repeating a trial yields the
    /// same output.
    pub fn apply(&self, command: f64, reference: f64) -> f64 {
        match *self {
            Self::Undershoot { error } => {
                if command > reference {
                    (command - error).max(reference)
                } else if command < reference {
                    (command + error).min(reference)
                } else {
                    command
                }
            }
        }
    }
}
