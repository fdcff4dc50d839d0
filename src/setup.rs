//! Experimental setup: the conversion layer between generic vectors and a backend.
//!
//! A setup holds two ordered lists of control points. Trial points turn the entries of
//! a [`TrialVector`] into backend commands; daq points turn backend measurements into
//! the entries of a [`ResponseVector`]. Both directions run through
//! [`ControlPoint::apply`].
//!
//! The backend is addressed one kind at a time: a trial drives every kind present in the
//! trial layout with a single call, and a response reads every kind present in the daq
//! layout with a single call. The channel of a point is its position among the points
//! of the same kind and role.
//!
//! An optional [`SignalFilter`] alters every command on its way to the backend. It
//! measures moves from the last committed command, so re-driving a trial after a revert
//! or a retransmission sends the same command again.
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{self, Capabilities, SharedBackend},
    control::{ControlPoint, ControlPointRegistry, ResponseKind},
    error::{BackendError, ConfigurationError, Error, ensure_finite},
    filter::SignalFilter,
    protocol::{ResponseVector, Sequence, TrialVector},
    site::{SiteLayout, Slot},
};

/// Arrangement of the actuators behind a setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupKind {
    /// A single actuator: every point on one dof, at most one point per kind and role.
    OneActuator,
    /// Any number of channels per kind.
    #[default]
    MultiActuator,
}

pub struct ExperimentalSetup {
    id: String,
    kind: SetupKind,
    trial: Vec<ControlPoint>,
    daq: Vec<ControlPoint>,
    /// Backend channel of each trial point.
    trial_channels: Vec<usize>,
    /// Backend channel of each daq point.
    daq_channels: Vec<usize>,
    trial_offsets: Vec<f64>,
    daq_offsets: Vec<f64>,
    filter: Option<SignalFilter>,
    /// Last command sent and last committed command of each trial point.
    commands: Vec<f64>,
    committed_commands: Vec<f64>,
    backend: SharedBackend,
}

impl std::fmt::Debug for ExperimentalSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentalSetup")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trial", &self.trial)
            .field("daq", &self.daq)
            .finish_non_exhaustive()
    }
}

impl ExperimentalSetup {
    pub fn new<S: AsRef<str>>(
        id: impl Into<String>,
        kind: SetupKind,
        registry: &ControlPointRegistry,
        trial_ids: &[S],
        daq_ids: &[S],
        backend: SharedBackend,
    ) -> Result<Self, Error> {
        let id = id.into();
        let trial = registry.resolve(trial_ids)?;
        let daq = registry.resolve(daq_ids)?;
        if trial.is_empty() || daq.is_empty() {
            return Err(ConfigurationError::Invalid(format!(
                "setup '{id}' needs at least one trial and one daq control point"
            ))
            .into());
        }
        if kind == SetupKind::OneActuator {
            check_one_actuator(&id, &trial, &daq)?;
        }

        {
            let backend = backend::lock(&backend)?;
            for kind in ResponseKind::ALL {
                let required = trial.iter().filter(|p| p.kind() == kind).count();
                let available = backend.control_channels(kind);
                if required > 0 && required != available {
                    return Err(ConfigurationError::ChannelCount {
                        kind: kind.name(),
                        available,
                        required,
                    }
                    .into());
                }

                let required = daq.iter().filter(|p| p.kind() == kind).count();
                let available = backend.daq_channels(kind);
                if required > available {
                    return Err(ConfigurationError::ChannelCount {
                        kind: kind.name(),
                        available,
                        required,
                    }
                    .into());
                }
            }
        }

        let trial_channels = channels(&trial);
        let daq_channels = channels(&daq);
        debug!(
            "setup '{id}': {} trial points, {} daq points",
            trial.len(),
            daq.len()
        );

        Ok(Self {
            id,
            kind,
            trial_offsets: vec![0.0; trial.len()],
            daq_offsets: vec![0.0; daq.len()],
            filter: None,
            commands: vec![0.0; trial.len()],
            committed_commands: vec![0.0; trial.len()],
            trial,
            daq,
            trial_channels,
            daq_channels,
            backend,
        })
    }

    pub fn with_filter(mut self, filter: SignalFilter) -> Result<Self, ConfigurationError> {
        filter.validate()?;
        info!("setup '{}' filters commands with {filter:?}", self.id);
        self.filter = Some(filter);
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SetupKind {
        self.kind
    }

    pub fn trial_size(&self) -> usize {
        self.trial.len()
    }

    pub fn daq_size(&self) -> usize {
        self.daq.len()
    }

    pub fn trial_points(&self) -> &[ControlPoint] {
        &self.trial
    }

    pub fn daq_points(&self) -> &[ControlPoint] {
        &self.daq
    }

    pub fn layout(&self) -> SiteLayout {
        let slots = |points: &[ControlPoint]| {
            points
                .iter()
                .map(|p| Slot::new(p.dof_index(), p.kind()))
                .collect()
        };
        SiteLayout {
            trial: slots(&self.trial),
            daq: slots(&self.daq),
        }
    }

    pub fn capabilities(&self) -> Result<Capabilities, BackendError> {
        Ok(backend::lock(&self.backend)?.capabilities())
    }

    pub fn backend_name(&self) -> Result<String, BackendError> {
        Ok(backend::lock(&self.backend)?.name().to_string())
    }

    /// Reads the backend once, fixes the relative offsets and returns the initial
    /// response.
    pub fn initialize(&mut self) -> Result<ResponseVector, Error> {
        let mut initial: Vec<(ResponseKind, Vec<f64>)> = Vec::new();
        {
            let mut backend = backend::lock(&self.backend)?;
            for kind in ResponseKind::ALL {
                let needed = self.daq.iter().any(|p| p.kind() == kind)
                    || self
                        .trial
                        .iter()
                        .any(|p| p.kind() == kind && p.is_relative_to_trial());
                if needed {
                    initial.push((kind, backend.acquire(kind)?));
                }
            }
        }
        let reading = |kind: ResponseKind, channel: usize| {
            initial
                .iter()
                .find(|(k, _)| *k == kind)
                .and_then(|(_, values)| values.get(channel).copied())
        };

        for (i, point) in self.trial.iter().enumerate() {
            let mut offset = 0.0;
            if point.is_relative_to_trial() {
                offset += reading(point.kind(), self.trial_channels[i]).ok_or(
                    ConfigurationError::ChannelCount {
                        kind: point.kind().name(),
                        available: 0,
                        required: self.trial_channels[i] + 1,
                    },
                )?;
            }
            if point.is_relative_to_control() {
                let reference = self
                    .daq
                    .iter()
                    .position(|d| d.dof_index() == point.dof_index() && d.kind() == point.kind())
                    .ok_or_else(|| {
                        ConfigurationError::Invalid(format!(
                            "control point '{}' is relative to control but no daq point \
                             measures {} at dof {}",
                            point.id(),
                            point.kind(),
                            point.dof_index()
                        ))
                    })?;
                offset += reading(point.kind(), self.daq_channels[reference]).unwrap_or(0.0);
            }
            self.trial_offsets[i] = offset;
            self.committed_commands[i] = offset;
        }
        self.commands.copy_from_slice(&self.committed_commands);

        for (i, point) in self.daq.iter().enumerate() {
            self.daq_offsets[i] = if point.is_relative_to_measured() {
                reading(point.kind(), self.daq_channels[i]).unwrap_or(0.0)
            } else {
                0.0
            };
        }
        info!("setup '{}' initialized", self.id);

        self.get_daq_response(Sequence::default())
    }

    /// Converts and imposes a trial vector on the backend.
    pub fn set_trial(&mut self, trial: &TrialVector) -> Result<(), Error> {
        if trial.len() != self.trial.len() {
            return Err(ConfigurationError::SizeMismatch {
                what: "trial vector",
                expected: self.trial.len(),
                received: trial.len(),
            }
            .into());
        }
        ensure_finite("trial", &trial.values)?;

        for (i, point) in self.trial.iter().enumerate() {
            let command = point.apply(trial.values[i]) + self.trial_offsets[i];
            self.commands[i] = match &self.filter {
                Some(filter) => filter.apply(command, self.committed_commands[i]),
                None => command,
            };
        }

        let mut backend = backend::lock(&self.backend)?;
        for kind in ResponseKind::ALL {
            let commands: Vec<f64> = self
                .trial
                .iter()
                .zip(&self.commands)
                .filter(|(point, _)| point.kind() == kind)
                .map(|(_, command)| *command)
                .collect();
            if !commands.is_empty() {
                backend.drive(kind, &commands)?;
            }
        }
        Ok(())
    }

    /// Reads the backend and converts the measurements into a response vector.
    pub fn get_daq_response(&mut self, sequence: Sequence) -> Result<ResponseVector, Error> {
        let mut values = vec![0.0; self.daq.len()];
        let mut backend = backend::lock(&self.backend)?;
        for kind in ResponseKind::ALL {
            if !self.daq.iter().any(|p| p.kind() == kind) {
                continue;
            }
            let measured = backend.acquire(kind)?;
            for (i, point) in self.daq.iter().enumerate() {
                if point.kind() != kind {
                    continue;
                }
                let raw = measured.get(self.daq_channels[i]).copied().ok_or_else(|| {
                    BackendError::ChannelMismatch {
                        backend: backend.name().to_string(),
                        expected: self.daq_channels[i] + 1,
                        received: measured.len(),
                    }
                })?;
                values[i] = point.apply(raw - self.daq_offsets[i]);
            }
        }
        Ok(ResponseVector::new(sequence, values))
    }

    pub fn commit(&mut self) -> Result<(), BackendError> {
        backend::lock(&self.backend)?.commit()?;
        self.committed_commands.copy_from_slice(&self.commands);
        Ok(())
    }

    pub fn revert(&mut self) -> Result<(), BackendError> {
        backend::lock(&self.backend)?.revert()?;
        self.commands.copy_from_slice(&self.committed_commands);
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<(), BackendError> {
        backend::lock(&self.backend)?.shutdown()
    }
}

/// Position of each point among the points of the same kind.
fn channels(points: &[ControlPoint]) -> Vec<usize> {
    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            points[..i]
                .iter()
                .filter(|other| other.kind() == point.kind())
                .count()
        })
        .collect()
}

fn check_one_actuator(
    id: &str,
    trial: &[ControlPoint],
    daq: &[ControlPoint],
) -> Result<(), ConfigurationError> {
    let dof = trial[0].dof_index();
    if let Some(point) = trial.iter().chain(daq).find(|p| p.dof_index() != dof) {
        return Err(ConfigurationError::Invalid(format!(
            "one-actuator setup '{id}' mixes dofs {dof} and {}",
            point.dof_index()
        )));
    }
    for points in [trial, daq] {
        for (i, point) in points.iter().enumerate() {
            if points[..i].iter().any(|p| p.kind() == point.kind()) {
                return Err(ConfigurationError::Invalid(format!(
                    "one-actuator setup '{id}' has two {} points in one role",
                    point.kind()
                )));
            }
        }
    }
    Ok(())
}
