#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use hybridsim::{
    Error,
    backend::{Capabilities, ControlBackend, MaterialConfig, SimMaterials, shared},
    control::{ControlPoint, ControlPointRegistry, ResponseKind},
    error::BackendError,
    protocol::{Endpoint, TransportMode},
    setup::{ExperimentalSetup, SetupKind},
    site::{ActorSite, LocalSite, RemoteSite, SessionReport},
};

/// Single spring behind a controller that takes `delay` to move.
///
/// Counts every command it receives; the count is shared with the test.
pub struct TestBackend {
    pub stiffness: f64,
    pub position: f64,
    pub delay: Duration,
    pub delay_first_only: bool,
    pub physical: bool,
    pub drives: Arc<AtomicUsize>,
}

impl TestBackend {
    pub fn new(stiffness: f64, delay: Duration, physical: bool) -> Self {
        Self {
            stiffness,
            position: 0.0,
            delay,
            delay_first_only: false,
            physical,
            drives: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ControlBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_revert: !self.physical,
            physical: self.physical,
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
        let previous = self.drives.fetch_add(1, Ordering::SeqCst);
        if previous == 0 || !self.delay_first_only {
            thread::sleep(self.delay);
        }
        self.position = values[0];
        Ok(())
    }

    fn acquire(&mut self, kind: ResponseKind) -> Result<Vec<f64>, BackendError> {
        Ok(match kind {
            ResponseKind::Force => vec![self.stiffness * self.position],
            _ => vec![self.position],
        })
    }

    fn revert(&mut self) -> Result<(), BackendError> {
        if self.physical {
            return Err(BackendError::RevertUnsupported("test".to_string()));
        }
        Ok(())
    }
}

pub fn registry() -> ControlPointRegistry {
    vec![
        ControlPoint::new("cmd", 0, ResponseKind::Displacement),
        ControlPoint::new("disp", 0, ResponseKind::Displacement),
        ControlPoint::new("force", 0, ResponseKind::Force),
    ]
    .try_into()
    .unwrap()
}

pub fn site_with<B: ControlBackend + 'static>(id: &str, backend: B) -> LocalSite {
    let setup = ExperimentalSetup::new(
        "one-actuator",
        SetupKind::OneActuator,
        &registry(),
        &["cmd"],
        &["disp", "force"],
        shared(backend),
    )
    .unwrap();
    LocalSite::new(id, setup).unwrap()
}

/// Site over an elastic-perfectly-plastic spring.
pub fn sim_site(id: &str, stiffness: f64, yield_force: f64) -> LocalSite {
    site_with(
        id,
        SimMaterials::from_configs(&[MaterialConfig::ElasticPerfectlyPlastic {
            stiffness,
            yield_force,
        }])
        .unwrap(),
    )
}

/// Serves `site` on a loopback port from a background thread.
pub fn spawn_actor(
    site: LocalSite,
    mode: TransportMode,
) -> (SocketAddr, thread::JoinHandle<Result<SessionReport, Error>>) {
    let actor = ActorSite::bind(site, "127.0.0.1:0", mode).unwrap();
    let addr = actor.local_addr().unwrap();
    (addr, thread::spawn(move || actor.run()))
}

pub fn connect(addr: SocketAddr, mode: TransportMode, deadline: Option<Duration>) -> RemoteSite {
    RemoteSite::connect(&Endpoint::from(addr), mode, 1, 1, 8, deadline).unwrap()
}
