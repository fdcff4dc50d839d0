//! Control backends: whatever finally imposes commands and reads measurements.
//!
//! A backend exposes numbered channels per [`ResponseKind`]. The experimental setup
//! drives every control channel of a kind with one call and reads every measurement
//! channel of a kind with one call; channel numbers are the position of a control point
//! among the points of the same kind.
//!
//! Two backends ship with the crate:
//!
//! - [`SimMaterials`]: in-process uniaxial springs, one per channel. Deterministic and
//!   able to return to the last committed state.
//! - [`GenericTcp`]: a physical controller reached over the frame transport. Commands
//!   move hardware, so it is never re-driven for a retransmitted trial and cannot revert.
mod generic_tcp;
mod material;

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    control::ResponseKind,
    error::{BackendError, Error},
    protocol::{Endpoint, TransportMode},
};

pub use generic_tcp::{GenericTcp, SignalSizes};
pub use material::{MaterialConfig, SimMaterials, UniaxialMaterial};

/// What a backend can do beyond driving and reading channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Capabilities {
    /// Can return to the last committed state.
    pub supports_revert: bool,
    /// Commands move real hardware; repeating one is not harmless.
    pub physical: bool,
}

pub trait ControlBackend: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Number of channels that accept commands of `kind`.
    fn control_channels(&self, kind: ResponseKind) -> usize;

    /// Number of channels that report measurements of `kind`.
    fn daq_channels(&self, kind: ResponseKind) -> usize;

    /// Imposes `values` on the control channels of `kind`, one value per channel.
    fn drive(&mut self, kind: ResponseKind, values: &[f64]) -> Result<(), BackendError>;

    /// Reads every measurement channel of `kind`.
    fn acquire(&mut self, kind: ResponseKind) -> Result<Vec<f64>, BackendError>;

    fn commit(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn revert(&mut self) -> Result<(), BackendError> {
        Err(BackendError::RevertUnsupported(self.name().to_string()))
    }

    fn shutdown(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backend handle shared between a setup and whoever built it.
pub type SharedBackend = Arc<Mutex<dyn ControlBackend>>;

pub fn shared<B: ControlBackend + 'static>(backend: B) -> SharedBackend {
    Arc::new(Mutex::new(backend))
}

pub(crate) fn lock(
    backend: &SharedBackend,
) -> Result<MutexGuard<'_, dyn ControlBackend + 'static>, BackendError> {
    backend.lock().map_err(|_| BackendError::Poisoned)
}

/// Backend selection with its typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlBackendKind {
    SimMaterials {
        materials: Vec<MaterialConfig>,
    },
    GenericTcp {
        endpoint: Endpoint,
        #[serde(default)]
        mode: TransportMode,
        payload_size: usize,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
        #[serde(default)]
        control: SignalSizes,
        #[serde(default)]
        daq: SignalSizes,
    },
}

fn default_timeout_ms() -> u64 {
    5000
}

impl ControlBackendKind {
    pub fn build(&self) -> Result<SharedBackend, Error> {
        let backend = match self {
            ControlBackendKind::SimMaterials { materials } => {
                shared(SimMaterials::from_configs(materials)?)
            }
            ControlBackendKind::GenericTcp {
                endpoint,
                mode,
                payload_size,
                timeout_ms,
                control,
                daq,
            } => shared(GenericTcp::connect(
                endpoint,
                *mode,
                *payload_size,
                Duration::from_millis(*timeout_ms),
                *control,
                *daq,
            )?),
        };
        Ok(backend)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Physical-style backend that reports its command count as the force reading.
    #[derive(Debug, Default)]
    pub struct CountingBackend {
        pub drives: usize,
        pub position: f64,
    }

    impl ControlBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_revert: false,
                physical: true,
            }
        }

        fn control_channels(&self, kind: ResponseKind) -> usize {
            usize::from(kind == ResponseKind::Displacement)
        }

        fn daq_channels(&self, kind: ResponseKind) -> usize {
            usize::from(matches!(
                kind,
                ResponseKind::Displacement | ResponseKind::Force
            ))
        }

        fn drive(&mut self, _kind: ResponseKind, values: &[f64]) -> Result<(), BackendError> {
            self.drives += 1;
            self.position = values[0];
            Ok(())
        }

        fn acquire(&mut self, kind: ResponseKind) -> Result<Vec<f64>, BackendError> {
            match kind {
                ResponseKind::Displacement => Ok(vec![self.position]),
                _ => Ok(vec![self.drives as f64]),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sim_materials_kind() {
        let kind: ControlBackendKind = serde_json::from_str(
            r#"{ "type": "sim_materials",
                 "materials": [{ "type": "elastic", "stiffness": 10.0 }] }"#,
        )
        .unwrap();
        let backend = kind.build().unwrap();
        let backend = lock(&backend).unwrap();
        assert_eq!(backend.control_channels(ResponseKind::Displacement), 1);
        assert!(backend.capabilities().supports_revert);
    }

    #[test]
    fn parse_generic_tcp_defaults() {
        let kind: ControlBackendKind = serde_json::from_str(
            r#"{ "type": "generic_tcp",
                 "endpoint": { "host": "127.0.0.1", "port": 7000 },
                 "payload_size": 16,
                 "control": { "displacement": 1 },
                 "daq": { "displacement": 1, "force": 1 } }"#,
        )
        .unwrap();
        match kind {
            ControlBackendKind::GenericTcp {
                mode,
                timeout_ms,
                daq,
                ..
            } => {
                assert_eq!(mode, TransportMode::Stream);
                assert_eq!(timeout_ms, 5000);
                assert_eq!(daq.get(ResponseKind::Force), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_revert_is_unsupported() {
        let mut backend = testing::CountingBackend::default();
        assert!(matches!(
            backend.revert(),
            Err(BackendError::RevertUnsupported(name)) if name == "counting"
        ));
    }

    #[test]
    fn poisoned_backend_is_backend_error() {
        let backend = shared(testing::CountingBackend::default());
        let clone = backend.clone();
        let _ = std::thread::spawn(move || {
            let _guard = lock(&clone).unwrap();
            panic!("controller thread died");
        })
        .join();

        assert!(matches!(lock(&backend), Err(BackendError::Poisoned)));
    }
}
