use log::trace;
use serde::{Deserialize, Serialize};

use crate::{
    control::ResponseKind,
    error::{BackendError, ConfigurationError},
};

use super::{Capabilities, ControlBackend};

/// Constitutive law of a simulated specimen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaterialConfig {
    /// `force = stiffness * disp + damping * vel`
    Elastic {
        stiffness: f64,
        #[serde(default)]
        damping: f64,
    },
    /// Elastic up to `yield_force`, perfectly plastic beyond.
    ElasticPerfectlyPlastic { stiffness: f64, yield_force: f64 },
}

impl MaterialConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        let ok = match *self {
            MaterialConfig::Elastic { stiffness, damping } => {
                stiffness.is_finite() && damping.is_finite()
            }
            MaterialConfig::ElasticPerfectlyPlastic {
                stiffness,
                yield_force,
            } => stiffness.is_finite() && stiffness > 0.0 && yield_force.is_finite() && yield_force > 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigurationError::Invalid(format!(
                "invalid material parameters {self:?}"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct MaterialState {
    strain: f64,
    strain_rate: f64,
    stress: f64,
    plastic_strain: f64,
}

/// One simulated specimen with trial and committed state.
#[derive(Debug, Clone, PartialEq)]
pub struct UniaxialMaterial {
    config: MaterialConfig,
    trial: MaterialState,
    committed: MaterialState,
}

impl UniaxialMaterial {
    pub fn new(config: MaterialConfig) -> Self {
        Self {
            config,
            trial: MaterialState::default(),
            committed: MaterialState::default(),
        }
    }

    pub fn set_trial_strain(&mut self, strain: f64, strain_rate: f64) {
        self.trial.strain = strain;
        self.trial.strain_rate = strain_rate;

        match self.config {
            MaterialConfig::Elastic { stiffness, damping } => {
                self.trial.stress = stiffness * strain + damping * strain_rate;
            }
            MaterialConfig::ElasticPerfectlyPlastic {
                stiffness,
                yield_force,
            } => {
                let plastic = self.committed.plastic_strain;
                let elastic = stiffness * (strain - plastic);
                if elastic.abs() > yield_force {
                    let stress = yield_force.copysign(elastic);
                    self.trial.stress = stress;
                    self.trial.plastic_strain = strain - stress / stiffness;
                } else {
                    self.trial.stress = elastic;
                    self.trial.plastic_strain = plastic;
                }
            }
        }
    }

    pub fn strain(&self) -> f64 {
        self.trial.strain
    }

    pub fn strain_rate(&self) -> f64 {
        self.trial.strain_rate
    }

    pub fn stress(&self) -> f64 {
        self.trial.stress
    }

    /// Initial tangent of the material.
    pub fn initial_stiffness(&self) -> f64 {
        match self.config {
            MaterialConfig::Elastic { stiffness, .. }
            | MaterialConfig::ElasticPerfectlyPlastic { stiffness, .. } => stiffness,
        }
    }

    pub fn commit(&mut self) {
        self.committed = self.trial;
    }

    pub fn revert(&mut self) {
        self.trial = self.committed;
    }
}

/// Simulated specimens, one uniaxial material per channel.
///
/// Displacement and velocity are controllable; displacement, velocity and force are
/// measurable. Driving one kind keeps the last command of the other.
#[derive(Debug, Clone)]
pub struct SimMaterials {
    materials: Vec<UniaxialMaterial>,
}

impl SimMaterials {
    pub fn new(materials: Vec<UniaxialMaterial>) -> Self {
        Self { materials }
    }

    pub fn from_configs(configs: &[MaterialConfig]) -> Result<Self, ConfigurationError> {
        if configs.is_empty() {
            return Err(ConfigurationError::Invalid(
                "simulated backend needs at least one material".to_string(),
            ));
        }
        for config in configs {
            config.validate()?;
        }
        Ok(Self::new(
            configs.iter().copied().map(UniaxialMaterial::new).collect(),
        ))
    }

    pub fn materials(&self) -> &[UniaxialMaterial] {
        &self.materials
    }

    fn unsupported(&self, kind: ResponseKind) -> BackendError {
        BackendError::UnsupportedQuantity {
            backend: self.name().to_string(),
            kind: kind.name(),
        }
    }
}

impl ControlBackend for SimMaterials {
    fn name(&self) -> &str {
        "sim_materials"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_revert: true,
            physical: false,
        }
    }

    fn control_channels(&self, kind: ResponseKind) -> usize {
        match kind {
            ResponseKind::Displacement | ResponseKind::Velocity => self.materials.len(),
            _ => 0,
        }
    }

    fn daq_channels(&self, kind: ResponseKind) -> usize {
        match kind {
            ResponseKind::Acceleration => 0,
            _ => self.materials.len(),
        }
    }

    fn drive(&mut self, kind: ResponseKind, values: &[f64]) -> Result<(), BackendError> {
        if self.control_channels(kind) == 0 {
            return Err(self.unsupported(kind));
        }
        if values.len() != self.materials.len() {
            return Err(BackendError::ChannelMismatch {
                backend: self.name().to_string(),
                expected: self.materials.len(),
                received: values.len(),
            });
        }

        for (material, &value) in self.materials.iter_mut().zip(values) {
            let (strain, rate) = match kind {
                ResponseKind::Displacement => (value, material.strain_rate()),
                _ => (material.strain(), value),
            };
            material.set_trial_strain(strain, rate);
        }
        trace!("drove {} {kind} channels", values.len());
        Ok(())
    }

    fn acquire(&mut self, kind: ResponseKind) -> Result<Vec<f64>, BackendError> {
        let read: fn(&UniaxialMaterial) -> f64 = match kind {
            ResponseKind::Displacement => UniaxialMaterial::strain,
            ResponseKind::Velocity => UniaxialMaterial::strain_rate,
            ResponseKind::Force => UniaxialMaterial::stress,
            ResponseKind::Acceleration => return Err(self.unsupported(kind)),
        };
        Ok(self.materials.iter().map(read).collect())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.materials.iter_mut().for_each(UniaxialMaterial::commit);
        Ok(())
    }

    fn revert(&mut self) -> Result<(), BackendError> {
        self.materials.iter_mut().for_each(UniaxialMaterial::revert);
        Ok(())
    }
}
