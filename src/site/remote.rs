use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    backend::Capabilities,
    error::{ConfigurationError, ConnectionError, Error, ProtocolError, TransportError, ensure_finite},
    protocol::{
        Endpoint, Hello, HelloReply, Message, Reply, Request, ResponseVector, Sequence, Session,
        Status, TransportMode, TrialVector, required_payload,
    },
};

use super::{ExperimentalSite, RevertOutcome, SiteLayout};

/// Wait for the stop acknowledgement when the session has no deadline.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Solver-side proxy of an [`ActorSite`](super::ActorSite).
///
/// Enforces the same alternation as the site before anything is sent. Every request
/// carries a fresh id and only the reply echoing that id answers it. Over stream
/// transport every failure is fatal; over datagrams a request that times out is sent
/// once more before giving up, and replies to earlier requests are dropped.
#[derive(Debug)]
pub struct RemoteSite {
    id: String,
    setup_id: String,
    layout: SiteLayout,
    capabilities: Capabilities,
    session: Session,
    pending: Option<ResponseVector>,
    last_answered: Option<Sequence>,
    last_committed: Option<Sequence>,
    next_request: u64,
    closed: bool,
}

impl RemoteSite {
    /// Opens a session and performs the handshake.
    pub fn connect(
        endpoint: &Endpoint,
        mode: TransportMode,
        element_id: u32,
        dof_count: usize,
        payload_size: usize,
        deadline: Option<Duration>,
    ) -> Result<Self, ConnectionError> {
        let mut session = Session::open(endpoint, mode, payload_size, deadline)?;
        session.send_hello(&Hello {
            element_id,
            dof_count: dof_count as u32,
            payload_size: payload_size as u32,
        })?;

        let (site_id, setup_id, layout, capabilities) = match session.receive_hello()? {
            HelloReply::Accepted {
                site_id,
                setup_id,
                layout,
                capabilities,
            } => (site_id, setup_id, layout, capabilities),
            HelloReply::Rejected { reason } => return Err(ConnectionError::Rejected(reason)),
        };

        let required = required_payload(layout.trial_size(), layout.daq_size());
        if payload_size < required {
            return Err(ConnectionError::Rejected(
                ConfigurationError::PayloadTooSmall {
                    required,
                    payload: payload_size,
                }
                .to_string(),
            ));
        }
        session.set_identity(&site_id, &setup_id);
        info!("element {element_id} connected to site '{site_id}' (setup '{setup_id}') at {endpoint}");

        Ok(Self {
            id: site_id,
            setup_id,
            layout,
            capabilities,
            session,
            pending: None,
            last_answered: None,
            last_committed: None,
            next_request: 1,
            closed: false,
        })
    }

    pub fn setup_id(&self) -> &str {
        &self.setup_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.closed {
            Err(ProtocolError::Closed)
        } else {
            Ok(())
        }
    }

    /// Closes the session after a reply that breaks the exchange.
    fn abandon(&mut self, error: ProtocolError) -> Error {
        self.session.close();
        self.closed = true;
        error.into()
    }

    fn take_request_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Sends `message` and waits for its reply, which must answer `expected` when given.
    ///
    /// Any error closes the session.
    fn round_trip(
        &mut self,
        message: Message,
        expected: Option<Sequence>,
        value_count: usize,
    ) -> Result<Reply, Error> {
        let res = self.try_round_trip(message, expected, value_count);
        if res.is_err() {
            self.session.close();
            self.closed = true;
        }
        res
    }

    fn try_round_trip(
        &mut self,
        message: Message,
        expected: Option<Sequence>,
        value_count: usize,
    ) -> Result<Reply, Error> {
        let payload = self.session.payload_size();
        let id = self.take_request_id();
        let request = Request::new(id, message);
        let frame = request.to_frame(payload)?;
        let datagram = self.session.mode() == TransportMode::Datagram;
        let mut retried = false;

        self.session.send_frame(&frame)?;
        let reply = loop {
            let reply = match self.session.receive_frame(payload) {
                Ok(reply) => reply,
                Err(TransportError::Timeout { waited }) if datagram && !retried => {
                    warn!(
                        "no reply from site '{}' within {waited:?}, sending {:?} again",
                        self.id,
                        request.message.action()
                    );
                    retried = true;
                    self.session.send_frame(&frame)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let reply = Reply::from_frame(&reply, value_count)?;
            if reply.request == id {
                break reply;
            }
            if datagram && reply.request != 0 && reply.request < id {
                debug!("dropping stale reply to request {}", reply.request);
                continue;
            }
            // The site answers a request it could not read with id 0.
            if reply.request == 0 && reply.status == Status::Failed {
                break reply;
            }
            return Err(ProtocolError::UnmatchedReply {
                expected: id,
                received: reply.request,
            }
            .into());
        };

        let reply = reply.into_result()?;
        match expected {
            Some(expected) if reply.sequence != expected => Err(ProtocolError::OutOfOrder {
                expected,
                received: reply.sequence,
            }
            .into()),
            _ => Ok(reply),
        }
    }

    /// Sends the stop message and waits for its acknowledgement.
    fn stop(&mut self) -> Result<Reply, Error> {
        let payload = self.session.payload_size();
        let id = self.take_request_id();
        let frame = Request::new(id, Message::Die).to_frame(payload)?;
        self.session.send_frame(&frame)?;
        loop {
            let reply = Reply::from_frame(&self.session.receive_frame(payload)?, 0)?;
            if reply.request == id {
                return Ok(reply);
            }
            debug!("dropping stale reply to request {}", reply.request);
        }
    }
}

impl ExperimentalSite for RemoteSite {
    fn id(&self) -> &str {
        &self.id
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn set_trial(&mut self, trial: &TrialVector) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(pending) = &self.pending {
            return Err(ProtocolError::TrialOutstanding {
                pending: pending.sequence,
            }
            .into());
        }
        if trial.len() != self.layout.trial_size() {
            return Err(ConfigurationError::SizeMismatch {
                what: "trial vector",
                expected: self.layout.trial_size(),
                received: trial.len(),
            }
            .into());
        }
        ensure_finite("trial", &trial.values)?;
        if let Some(last) = self.last_answered {
            if trial.sequence <= last {
                return Err(ProtocolError::OutOfOrder {
                    expected: last.next_iteration(),
                    received: trial.sequence,
                }
                .into());
            }
        }

        let reply = self.round_trip(
            Message::Trial(trial.clone()),
            Some(trial.sequence),
            self.layout.daq_size(),
        )?;
        let response = reply.into_response();
        ensure_finite("response", &response.values)?;
        self.last_answered = Some(trial.sequence);
        self.pending = Some(response);
        Ok(())
    }

    fn get_daq_response(&mut self) -> Result<ResponseVector, Error> {
        self.ensure_open()?;
        Ok(self.pending.take().ok_or(ProtocolError::NoPendingTrial)?)
    }

    fn commit(&mut self, sequence: Sequence) -> Result<(), Error> {
        self.ensure_open()?;
        if let Some(pending) = &self.pending {
            return Err(ProtocolError::TrialOutstanding {
                pending: pending.sequence,
            }
            .into());
        }
        if self.last_committed == Some(sequence) {
            return Ok(());
        }
        if self.last_answered != Some(sequence) {
            return Err(ProtocolError::CommitWithoutTrial { received: sequence }.into());
        }

        let reply = self.round_trip(Message::Commit(sequence), Some(sequence), 0)?;
        if reply.status != Status::Completed {
            return Err(self.abandon(ProtocolError::Unexpected(format!(
                "commit answered with {:?}",
                reply.status
            ))));
        }
        self.last_committed = Some(sequence);
        Ok(())
    }

    fn revert(&mut self) -> Result<RevertOutcome, Error> {
        self.ensure_open()?;
        self.pending = None;

        let committed = self.last_committed.unwrap_or_default();
        let reply = self.round_trip(Message::Revert(committed), None, self.layout.daq_size())?;
        let authoritative = match reply.status {
            Status::Completed => true,
            Status::Approximate => false,
            other => {
                return Err(self.abandon(ProtocolError::Unexpected(format!(
                    "revert answered with {other:?}"
                ))));
            }
        };
        if authoritative && reply.sequence != committed {
            return Err(self.abandon(ProtocolError::OutOfOrder {
                expected: committed,
                received: reply.sequence,
            }));
        }
        self.last_answered = self.last_committed;
        Ok(RevertOutcome {
            response: reply.into_response(),
            authoritative,
        })
    }

    /// Sends the stop message and waits briefly for its acknowledgement.
    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.session.deadline().is_none() {
            self.session.set_deadline(Some(CLOSE_GRACE));
        }
        let res = self.stop();
        match res {
            Ok(reply) if reply.status == Status::Received => {
                debug!("site '{}' acknowledged stop", self.id)
            }
            Ok(reply) => warn!("site '{}' answered stop with {:?}", self.id, reply.status),
            Err(e) => warn!("site '{}' did not acknowledge stop: {e}", self.id),
        }
        self.session.close();
        info!("session with site '{}' closed", self.id);
        Ok(())
    }
}

impl Drop for RemoteSite {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, TcpListener, UdpSocket},
        thread::{self, JoinHandle},
    };

    use crate::{
        control::ResponseKind,
        error::FailureKind,
        protocol::{self, Frame},
        site::Slot,
    };

    use super::*;

    fn accepted() -> HelloReply {
        HelloReply::Accepted {
            site_id: "scripted".to_string(),
            setup_id: "scripted".to_string(),
            layout: SiteLayout {
                trial: vec![Slot::new(0, ResponseKind::Displacement)],
                daq: vec![Slot::new(0, ResponseKind::Force)],
            },
            capabilities: Capabilities {
                supports_revert: false,
                physical: true,
            },
        }
    }

    /// Site that accepts one session and hands it to `script`.
    fn scripted_site<F>(mode: TransportMode, script: F) -> (SocketAddr, JoinHandle<()>)
    where
        F: FnOnce(&mut Session) + Send + 'static,
    {
        match mode {
            TransportMode::Stream => {
                let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                let addr = listener.local_addr().unwrap();
                let handle = thread::spawn(move || {
                    let (stream, _) = listener.accept().unwrap();
                    let mut session = Session::from_stream(stream, 0).unwrap();
                    let hello: Hello = session.receive_hello().unwrap();
                    session.set_payload_size(hello.payload_size as usize);
                    session.send_hello(&accepted()).unwrap();
                    script(&mut session);
                });
                (addr, handle)
            }
            TransportMode::Datagram => {
                let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
                let addr = socket.local_addr().unwrap();
                let handle = thread::spawn(move || {
                    let mut buf = vec![0_u8; 1024];
                    let (received, peer) = socket.recv_from(&mut buf).unwrap();
                    socket.connect(peer).unwrap();
                    let hello: Hello = protocol::decode_hello(&buf[..received]).unwrap();
                    let mut session =
                        Session::from_datagram(socket, hello.payload_size as usize).unwrap();
                    session.send_hello(&accepted()).unwrap();
                    script(&mut session);
                });
                (addr, handle)
            }
        }
    }

    fn next_request(session: &mut Session) -> Request {
        let frame = session.receive_frame(session.payload_size()).unwrap();
        Request::from_frame(&frame, 1).unwrap()
    }

    fn send(session: &mut Session, reply: Reply) {
        let frame = reply.to_frame(session.payload_size()).unwrap();
        session.send_frame(&frame).unwrap();
    }

    fn connect(addr: SocketAddr, mode: TransportMode) -> RemoteSite {
        RemoteSite::connect(
            &Endpoint::from(addr),
            mode,
            1,
            1,
            6,
            Some(Duration::from_millis(500)),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_trial_reply_does_not_answer_commit() {
        let (addr, site) = scripted_site(TransportMode::Datagram, |session| {
            let trial = next_request(session);
            let response = ResponseVector::new(trial.message.sequence(), vec![5.0]);
            // both copies of a retransmitted trial get answered
            send(session, Reply::response(trial.id, &response, true));
            send(session, Reply::response(trial.id, &response, true));

            let commit = next_request(session);
            assert_eq!(commit.message, Message::Commit(Sequence::new(1, 0)));
            assert!(commit.id > trial.id);
            send(
                session,
                Reply::failed(commit.id, FailureKind::Backend, Sequence::new(1, 0)),
            );
        });

        let mut remote = connect(addr, TransportMode::Datagram);
        let trial = TrialVector::new(Sequence::new(1, 0), vec![0.1]);
        assert_eq!(remote.exchange(&trial).unwrap().values, vec![5.0]);

        let res = remote.commit(Sequence::new(1, 0));
        assert!(matches!(
            res,
            Err(Error::Protocol(ProtocolError::SiteFailed {
                kind: FailureKind::Backend,
                ..
            }))
        ));
        assert!(matches!(
            remote.commit(Sequence::new(1, 0)),
            Err(Error::Protocol(ProtocolError::Closed))
        ));
        site.join().unwrap();
    }

    #[test]
    fn reply_to_another_request_breaks_stream_session() {
        let (addr, site) = scripted_site(TransportMode::Stream, |session| {
            let trial = next_request(session);
            let response = ResponseVector::new(trial.message.sequence(), vec![5.0]);
            send(session, Reply::response(trial.id + 1, &response, true));
        });

        let mut remote = connect(addr, TransportMode::Stream);
        let res = remote.set_trial(&TrialVector::new(Sequence::new(1, 0), vec![0.1]));
        assert!(matches!(
            res,
            Err(Error::Protocol(ProtocolError::UnmatchedReply { .. }))
        ));
        site.join().unwrap();
    }

    #[test]
    fn revert_must_return_to_the_last_commit() {
        let (addr, site) = scripted_site(TransportMode::Stream, |session| {
            let trial = next_request(session);
            let response = ResponseVector::new(trial.message.sequence(), vec![5.0]);
            send(session, Reply::response(trial.id, &response, true));

            let revert = next_request(session);
            assert_eq!(revert.message, Message::Revert(Sequence::default()));
            // an authoritative answer tagged with the uncommitted trial
            send(session, Reply::response(revert.id, &response, true));
        });

        let mut remote = connect(addr, TransportMode::Stream);
        remote
            .exchange(&TrialVector::new(Sequence::new(1, 0), vec![0.1]))
            .unwrap();
        assert!(matches!(
            remote.revert(),
            Err(Error::Protocol(ProtocolError::OutOfOrder { .. }))
        ));
        site.join().unwrap();
    }

    #[test]
    fn failure_for_unreadable_request_is_reported() {
        let (addr, site) = scripted_site(TransportMode::Stream, |session| {
            let frame: Frame = session.receive_frame(session.payload_size()).unwrap();
            assert_eq!(Request::id_of(&frame), 1);
            send(
                session,
                Reply::failed(0, FailureKind::Element, Sequence::new(1, 0)),
            );
        });

        let mut remote = connect(addr, TransportMode::Stream);
        let res = remote.set_trial(&TrialVector::new(Sequence::new(1, 0), vec![0.1]));
        assert!(matches!(
            res,
            Err(Error::Element(crate::error::ElementError::RejectedBySite { .. }))
        ));
        site.join().unwrap();
    }
}
