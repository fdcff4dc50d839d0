use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    control::ResponseKind,
    error::{BackendError, ConfigurationError, Error},
    protocol::{Action, Endpoint, Frame, Session, Status, TransportMode},
};

use super::{Capabilities, ControlBackend};

/// Slots before the values of a controller frame: action or status, kind, count.
const CONTROLLER_HEADER: usize = 3;

/// Number of channels per response kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSizes {
    pub displacement: usize,
    pub velocity: usize,
    pub acceleration: usize,
    pub force: usize,
}

impl SignalSizes {
    pub fn get(&self, kind: ResponseKind) -> usize {
        match kind {
            ResponseKind::Displacement => self.displacement,
            ResponseKind::Velocity => self.velocity,
            ResponseKind::Acceleration => self.acceleration,
            ResponseKind::Force => self.force,
        }
    }

    pub fn max(&self) -> usize {
        ResponseKind::ALL
            .iter()
            .map(|kind| self.get(*kind))
            .max()
            .unwrap_or(0)
    }
}

/// Physical controller reached over the frame transport.
///
/// Every call is one round trip of `payload_size` doubles. Requests are
/// `[action, kind, count, values...]`, replies `[status, kind, count, values...]`, both
/// zero padded. A non-zero status is a controller failure.
#[derive(Debug)]
pub struct GenericTcp {
    name: String,
    session: Session,
    control: SignalSizes,
    daq: SignalSizes,
}

impl GenericTcp {
    pub fn connect(
        endpoint: &Endpoint,
        mode: TransportMode,
        payload_size: usize,
        timeout: Duration,
        control: SignalSizes,
        daq: SignalSizes,
    ) -> Result<Self, Error> {
        let required = CONTROLLER_HEADER + control.max().max(daq.max());
        if payload_size < required {
            return Err(ConfigurationError::PayloadTooSmall {
                required,
                payload: payload_size,
            }
            .into());
        }

        let session = Session::open(endpoint, mode, payload_size, Some(timeout))?;
        info!("connected to controller at {endpoint}");
        Ok(Self {
            name: format!("generic_tcp@{endpoint}"),
            session,
            control,
            daq,
        })
    }

    fn round_trip(
        &mut self,
        action: Action,
        kind: Option<ResponseKind>,
        values: &[f64],
        count: usize,
    ) -> Result<Vec<f64>, BackendError> {
        let payload = self.session.payload_size();
        let mut frame = Frame::zeroed(payload);
        let slots = frame.values_mut();
        slots[0] = action.code();
        slots[1] = kind.map(ResponseKind::code).unwrap_or(0.0);
        slots[2] = values.len().max(count) as f64;
        slots[CONTROLLER_HEADER..CONTROLLER_HEADER + values.len()].copy_from_slice(values);
        self.session.send_frame(&frame)?;

        let reply = self.session.receive_frame(payload)?;
        let reply = reply.values();
        if reply[0] != Status::Completed.code() {
            return Err(BackendError::Controller(format!(
                "{action:?} answered with status {}",
                reply[0]
            )));
        }
        let received = reply[2] as usize;
        if received != count {
            return Err(BackendError::ChannelMismatch {
                backend: self.name.clone(),
                expected: count,
                received,
            });
        }
        Ok(reply[CONTROLLER_HEADER..CONTROLLER_HEADER + count].to_vec())
    }
}

impl ControlBackend for GenericTcp {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_revert: false,
            physical: true,
        }
    }

    fn control_channels(&self, kind: ResponseKind) -> usize {
        self.control.get(kind)
    }

    fn daq_channels(&self, kind: ResponseKind) -> usize {
        self.daq.get(kind)
    }

    fn drive(&mut self, kind: ResponseKind, values: &[f64]) -> Result<(), BackendError> {
        let expected = self.control.get(kind);
        if expected == 0 {
            return Err(BackendError::UnsupportedQuantity {
                backend: self.name.clone(),
                kind: kind.name(),
            });
        }
        if values.len() != expected {
            return Err(BackendError::ChannelMismatch {
                backend: self.name.clone(),
                expected,
                received: values.len(),
            });
        }
        // Controller echoes the channel count it accepted.
        self.round_trip(Action::SetTrial, Some(kind), values, expected)?;
        Ok(())
    }

    fn acquire(&mut self, kind: ResponseKind) -> Result<Vec<f64>, BackendError> {
        let count = self.daq.get(kind);
        if count == 0 {
            return Err(BackendError::UnsupportedQuantity {
                backend: self.name.clone(),
                kind: kind.name(),
            });
        }
        self.round_trip(Action::GetDaqResponse, Some(kind), &[], count)
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.round_trip(Action::Commit, None, &[], 0)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), BackendError> {
        if !self.session.is_open() {
            return Ok(());
        }
        let mut frame = Frame::zeroed(self.session.payload_size());
        frame.values_mut()[0] = Action::Die.code();
        if let Err(e) = self.session.send_frame(&frame) {
            warn!("failed to stop controller: {e}");
        }
        self.session.close();
        debug!("controller link {} closed", self.name);
        Ok(())
    }
}

impl Drop for GenericTcp {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;

    /// Controller with one displacement actuator and a spring of stiffness 3 behind it.
    fn spawn_controller(payload: usize) -> (Endpoint, thread::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut session = Session::from_stream(stream, payload).unwrap();
            let mut position = 0.0;
            let mut commands = 0;
            loop {
                let request = session.receive_frame(payload).unwrap();
                let request = request.values().to_vec();
                let mut reply = Frame::zeroed(payload);
                let slots = reply.values_mut();
                slots[1] = request[1];
                match Action::try_from(request[0]).unwrap() {
                    Action::SetTrial => {
                        commands += 1;
                        position = request[3];
                        slots[2] = 1.0;
                    }
                    Action::GetDaqResponse => {
                        slots[2] = 1.0;
                        slots[3] = match ResponseKind::from_code(request[1]).unwrap() {
                            ResponseKind::Force => 3.0 * position,
                            _ => position,
                        };
                    }
                    Action::Commit => {}
                    Action::Revert => slots[0] = Status::Failed.code(),
                    Action::Die => return commands,
                }
                session.send_frame(&reply).unwrap();
            }
        });
        (endpoint, handle)
    }

    fn sizes(displacement: usize, force: usize) -> SignalSizes {
        SignalSizes {
            displacement,
            force,
            ..SignalSizes::default()
        }
    }

    #[test]
    fn drive_and_acquire_through_controller() {
        let (endpoint, controller) = spawn_controller(8);
        let mut backend = GenericTcp::connect(
            &endpoint,
            TransportMode::Stream,
            8,
            Duration::from_secs(2),
            sizes(1, 0),
            sizes(1, 1),
        )
        .unwrap();

        backend.drive(ResponseKind::Displacement, &[0.5]).unwrap();
        assert_eq!(backend.acquire(ResponseKind::Force).unwrap(), vec![1.5]);
        assert_eq!(
            backend.acquire(ResponseKind::Displacement).unwrap(),
            vec![0.5]
        );
        backend.commit().unwrap();
        backend.shutdown().unwrap();

        assert_eq!(controller.join().unwrap(), 1);
    }

    #[test]
    fn capabilities_are_physical() {
        let (endpoint, controller) = spawn_controller(8);
        let backend = GenericTcp::connect(
            &endpoint,
            TransportMode::Stream,
            8,
            Duration::from_secs(2),
            sizes(1, 0),
            sizes(1, 1),
        )
        .unwrap();

        let caps = backend.capabilities();
        assert!(caps.physical);
        assert!(!caps.supports_revert);
        drop(backend);
        assert_eq!(controller.join().unwrap(), 0);
    }

    #[test]
    fn payload_too_small_is_configuration_error() {
        let res = GenericTcp::connect(
            &Endpoint::new("127.0.0.1", 9),
            TransportMode::Stream,
            3,
            Duration::from_millis(100),
            sizes(1, 0),
            sizes(1, 1),
        );
        assert!(matches!(
            res,
            Err(Error::Configuration(ConfigurationError::PayloadTooSmall { .. }))
        ));
    }
}
