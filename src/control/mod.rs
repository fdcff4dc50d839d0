//! Control points: named, scaled, limited signal channels.
//!
//! A [`ControlPoint`] describes one slot of an exchange: which degree of freedom it
//! refers to, which physical quantity it carries, and how raw values are scaled and
//! limited on their way to (trial path) or from (measured path) a control backend.
//!
//! The conversion [`ControlPoint::apply`] is pure:
//!
//! ```text
//! applied = clamp(raw * scale_factor, lower_limit, upper_limit)
//! ```
//!
//! so it can be evaluated any number of times during equilibrium iterations without
//! touching backend state.
//!
//! # Example
//! ```rust
//! use hybridsim::control::{ControlPoint, ResponseKind};
//!
//! let cp = ControlPoint::new("act1", 0, ResponseKind::Displacement)
//!     .with_scale(2.0)
//!     .unwrap()
//!     .with_limits(Some(-1.0), Some(1.0))
//!     .unwrap();
//!
//! assert_eq!(cp.apply(0.25), 0.5);
//! assert_eq!(cp.apply(3.0), 1.0);
//! ```
mod registry;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub use registry::ControlPointRegistry;

/// Physical quantity carried by a control point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    Displacement,
    Velocity,
    Acceleration,
    Force,
}

impl ResponseKind {
    /// Order in which quantities are driven and acquired.
    pub const ALL: [ResponseKind; 4] = [
        ResponseKind::Displacement,
        ResponseKind::Velocity,
        ResponseKind::Acceleration,
        ResponseKind::Force,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ResponseKind::Displacement => "displacement",
            ResponseKind::Velocity => "velocity",
            ResponseKind::Acceleration => "acceleration",
            ResponseKind::Force => "force",
        }
    }

    /// Wire code used by controller links.
    pub fn code(self) -> f64 {
        match self {
            ResponseKind::Displacement => 0.0,
            ResponseKind::Velocity => 1.0,
            ResponseKind::Acceleration => 2.0,
            ResponseKind::Force => 3.0,
        }
    }

    pub fn from_code(code: f64) -> Option<Self> {
        match code as i64 {
            0 => Some(ResponseKind::Displacement),
            1 => Some(ResponseKind::Velocity),
            2 => Some(ResponseKind::Acceleration),
            3 => Some(ResponseKind::Force),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Named channel between the solver and an experimental backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ControlPointConfig", into = "ControlPointConfig")]
pub struct ControlPoint {
    id: String,
    dof_index: usize,
    kind: ResponseKind,
    scale_factor: f64,
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
    relative_to_trial: bool,
    relative_to_control: bool,
    relative_to_measured: bool,
}

impl ControlPoint {
    /// Unit-scaled, unlimited control point.
    pub fn new(id: impl Into<String>, dof_index: usize, kind: ResponseKind) -> Self {
        Self {
            id: id.into(),
            dof_index,
            kind,
            scale_factor: 1.0,
            lower_limit: None,
            upper_limit: None,
            relative_to_trial: false,
            relative_to_control: false,
            relative_to_measured: false,
        }
    }

    pub fn with_scale(mut self, scale_factor: f64) -> Result<Self, ConfigurationError> {
        if scale_factor == 0.0 || !scale_factor.is_finite() {
            return Err(ConfigurationError::InvalidScaleFactor(self.id));
        }
        self.scale_factor = scale_factor;
        Ok(self)
    }

    pub fn with_limits(
        mut self,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> Result<Self, ConfigurationError> {
        if let (Some(lower), Some(upper)) = (lower, upper) {
            if lower > upper {
                return Err(ConfigurationError::InvertedLimits {
                    id: self.id,
                    lower,
                    upper,
                });
            }
        }
        if lower.is_some_and(f64::is_nan) || upper.is_some_and(f64::is_nan) {
            return Err(ConfigurationError::Invalid(format!(
                "control point '{}' has a NaN limit",
                self.id
            )));
        }
        self.lower_limit = lower;
        self.upper_limit = upper;
        Ok(self)
    }

    pub fn relative(mut self, trial: bool, control: bool, measured: bool) -> Self {
        self.relative_to_trial = trial;
        self.relative_to_control = control;
        self.relative_to_measured = measured;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dof_index(&self) -> usize {
        self.dof_index
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn limits(&self) -> (Option<f64>, Option<f64>) {
        (self.lower_limit, self.upper_limit)
    }

    pub fn is_relative_to_trial(&self) -> bool {
        self.relative_to_trial
    }

    pub fn is_relative_to_control(&self) -> bool {
        self.relative_to_control
    }

    pub fn is_relative_to_measured(&self) -> bool {
        self.relative_to_measured
    }

    /// Scales `raw` and clamps it into the configured limits.
    pub fn apply(&self, raw: f64) -> f64 {
        let mut value = raw * self.scale_factor;
        if let Some(lower) = self.lower_limit {
            value = value.max(lower);
        }
        if let Some(upper) = self.upper_limit {
            value = value.min(upper);
        }
        value
    }
}

/// Serialized form of a [`ControlPoint`]; validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPointConfig {
    pub id: String,
    pub dof: usize,
    pub kind: ResponseKind,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub lower_limit: Option<f64>,
    #[serde(default)]
    pub upper_limit: Option<f64>,
    #[serde(default)]
    pub relative_to_trial: bool,
    #[serde(default)]
    pub relative_to_control: bool,
    #[serde(default)]
    pub relative_to_measured: bool,
}

fn unit_scale() -> f64 {
    1.0
}

impl TryFrom<ControlPointConfig> for ControlPoint {
    type Error = ConfigurationError;

    fn try_from(value: ControlPointConfig) -> Result<Self, Self::Error> {
        Ok(ControlPoint::new(value.id, value.dof, value.kind)
            .with_scale(value.scale)?
            .with_limits(value.lower_limit, value.upper_limit)?
            .relative(
                value.relative_to_trial,
                value.relative_to_control,
                value.relative_to_measured,
            ))
    }
}

impl From<ControlPoint> for ControlPointConfig {
    fn from(value: ControlPoint) -> Self {
        Self {
            id: value.id,
            dof: value.dof_index,
            kind: value.kind,
            scale: value.scale_factor,
            lower_limit: value.lower_limit,
            upper_limit: value.upper_limit,
            relative_to_trial: value.relative_to_trial,
            relative_to_control: value.relative_to_control,
            relative_to_measured: value.relative_to_measured,
        }
    }
}
