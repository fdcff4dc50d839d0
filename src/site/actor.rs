use std::{
    io,
    net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket},
};

use log::{debug, error, info, warn};

use crate::{
    error::{ConfigurationError, Error, ProtocolError, TransportError},
    protocol::{
        self, Hello, HelloReply, Message, Reply, Request, Sequence, Session, Status,
        TransportMode, required_payload,
    },
};

use super::{ExperimentalSite, LocalSite};

/// Bound socket waiting for the single session of an actor.
#[derive(Debug)]
pub enum Listener {
    Stream(TcpListener),
    Datagram(UdpSocket),
}

impl Listener {
    pub fn bind<A: ToSocketAddrs>(address: A, mode: TransportMode) -> io::Result<Self> {
        Ok(match mode {
            TransportMode::Stream => Listener::Stream(TcpListener::bind(address)?),
            TransportMode::Datagram => Listener::Datagram(UdpSocket::bind(address)?),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Stream(listener) => listener.local_addr(),
            Listener::Datagram(socket) => socket.local_addr(),
        }
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            Listener::Stream(_) => TransportMode::Stream,
            Listener::Datagram(_) => TransportMode::Datagram,
        }
    }

    /// Waits for a peer and reads its opening message.
    ///
    /// A datagram listener becomes connected to the first peer it hears from.
    pub fn accept(self) -> Result<(Session, Hello), Error> {
        match self {
            Listener::Stream(listener) => {
                let (stream, peer) = listener.accept().map_err(TransportError::from)?;
                debug!("accepted stream session from {peer}");
                let mut session = Session::from_stream(stream, 0).map_err(TransportError::from)?;
                let hello = session.receive_hello()?;
                Ok((session, hello))
            }
            Listener::Datagram(socket) => {
                let mut buf = vec![0_u8; protocol::MAX_HELLO];
                let (received, peer) = socket.recv_from(&mut buf).map_err(TransportError::from)?;
                debug!("datagram session opened by {peer}");
                socket.connect(peer).map_err(TransportError::from)?;
                let hello = protocol::decode_hello(&buf[..received])?;
                let session = Session::from_datagram(socket, 0).map_err(TransportError::from)?;
                Ok((session, hello))
            }
        }
    }
}

/// Counters for one served session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub site_id: String,
    pub element_id: u32,
    pub trials: usize,
    pub commits: usize,
    pub last_committed: Option<Sequence>,
    /// `true` when the element said goodbye, `false` when it just went away.
    pub stopped_by_peer: bool,
}

/// Serves a [`LocalSite`] to exactly one remote session.
#[derive(Debug)]
pub struct ActorSite {
    site: LocalSite,
    listener: Listener,
}

impl ActorSite {
    pub fn new(site: LocalSite, listener: Listener) -> Self {
        Self { site, listener }
    }

    pub fn bind<A: ToSocketAddrs>(
        site: LocalSite,
        address: A,
        mode: TransportMode,
    ) -> Result<Self, Error> {
        let listener = Listener::bind(address, mode).map_err(TransportError::from)?;
        Ok(Self::new(site, listener))
    }

    pub fn id(&self) -> &str {
        self.site.id()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts the session and runs the exchange loop until the element stops or goes
    /// away. Any failure is reported to the element with a failed status before the
    /// session is closed.
    pub fn run(self) -> Result<SessionReport, Error> {
        let ActorSite { mut site, listener } = self;
        info!(
            "site '{}' waiting for a {:?} session on {}",
            site.id(),
            listener.mode(),
            listener.local_addr().map_err(TransportError::from)?
        );

        let (mut session, hello) = listener.accept()?;
        if let Err(e) = handshake(&mut site, &mut session, &hello) {
            let _ = site.close();
            return Err(e);
        }

        let mut report = SessionReport {
            site_id: site.id().to_string(),
            element_id: hello.element_id,
            ..SessionReport::default()
        };
        let res = serve(&mut site, &mut session, &mut report);
        session.close();
        if let Err(e) = site.close() {
            warn!("site '{}' failed to shut its backend down: {e}", report.site_id);
        }

        match res {
            Ok(()) => {
                info!(
                    "site '{}' session with element {} ended after {} trials",
                    report.site_id, report.element_id, report.trials
                );
                Ok(report)
            }
            Err(e) => {
                error!("site '{}' session failed: {e}", report.site_id);
                Err(e)
            }
        }
    }
}

fn handshake(site: &mut LocalSite, session: &mut Session, hello: &Hello) -> Result<(), Error> {
    let layout = site.layout().clone();
    let required = required_payload(layout.trial_size(), layout.daq_size());
    let payload = hello.payload_size as usize;

    let refusal = if payload < required {
        Some(ConfigurationError::PayloadTooSmall { required, payload })
    } else if layout
        .max_dof()
        .is_some_and(|dof| dof >= hello.dof_count as usize)
    {
        Some(ConfigurationError::Invalid(format!(
            "element {} has {} dofs, site layout needs {}",
            hello.element_id,
            hello.dof_count,
            layout.max_dof().map(|d| d + 1).unwrap_or(0)
        )))
    } else {
        None
    };

    if let Some(refusal) = refusal {
        warn!("site '{}' rejects element {}: {refusal}", site.id(), hello.element_id);
        session.send_hello(&HelloReply::Rejected {
            reason: refusal.to_string(),
        })?;
        return Err(refusal.into());
    }

    session.set_payload_size(payload);
    session.set_identity(site.id(), site.setup().id());
    session.send_hello(&HelloReply::Accepted {
        site_id: site.id().to_string(),
        setup_id: site.setup().id().to_string(),
        layout,
        capabilities: site.capabilities(),
    })?;
    info!(
        "site '{}' accepted element {} ({} doubles per frame)",
        site.id(),
        hello.element_id,
        payload
    );
    Ok(())
}

fn serve(site: &mut LocalSite, session: &mut Session, report: &mut SessionReport) -> Result<(), Error> {
    let payload = session.payload_size();
    let trial_size = site.layout().trial_size();

    loop {
        let frame = match session.receive_frame(payload) {
            Ok(frame) => frame,
            Err(TransportError::PeerClosed) => {
                info!("element closed the session with site '{}'", site.id());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let request = match Request::from_frame(&frame, trial_size) {
            Ok(request) => request,
            Err(e) => {
                return Err(fail(session, e.into(), Request::id_of(&frame), Sequence::default()));
            }
        };
        let Request { id, message } = request;
        debug!(
            "site '{}' received {:?} (request {id})",
            site.id(),
            message.action()
        );

        let sequence = message.sequence();
        let reply = match handle(site, id, message, report) {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                let ack = Reply::ack(id, Status::Received, sequence);
                session.send_frame(&ack.to_frame(payload)?)?;
                report.stopped_by_peer = true;
                return Ok(());
            }
            Err(e) => return Err(fail(session, e, id, sequence)),
        };

        let frame = reply.to_frame(payload)?;
        session.send_frame(&frame)?;
    }
}

/// Applies one request to the site; `None` asks to end the session.
fn handle(
    site: &mut LocalSite,
    id: u64,
    message: Message,
    report: &mut SessionReport,
) -> Result<Option<Reply>, Error> {
    let reply = match message {
        Message::Trial(trial) => {
            let response = site.exchange(&trial)?;
            report.trials += 1;
            Reply::response(id, &response, true)
        }
        Message::GetDaqResponse(sequence) => {
            Reply::response(id, &site.response_for(sequence)?, true)
        }
        Message::Commit(sequence) => {
            let repeated = site.last_committed() == Some(sequence);
            site.commit(sequence)?;
            if !repeated {
                report.commits += 1;
                report.last_committed = Some(sequence);
            }
            Reply::ack(id, Status::Completed, sequence)
        }
        Message::Revert(sequence) => {
            let committed = site.last_committed().unwrap_or_default();
            if sequence != committed {
                return Err(ProtocolError::OutOfOrder {
                    expected: committed,
                    received: sequence,
                }
                .into());
            }
            let outcome = site.revert()?;
            Reply::response(id, &outcome.response, outcome.authoritative)
        }
        Message::Die => return Ok(None),
    };
    Ok(Some(reply))
}

/// Tells the element why the session ends; the original error is kept.
fn fail(session: &mut Session, error: Error, request: u64, sequence: Sequence) -> Error {
    let reply = Reply::failed(request, error.failure_kind(), sequence);
    match reply.to_frame(session.payload_size()) {
        Ok(frame) => {
            if let Err(e) = session.send_frame(&frame) {
                warn!("failed to report failure to element: {e}");
            }
        }
        Err(e) => warn!("failed to encode failure reply: {e}"),
    }
    error
}

