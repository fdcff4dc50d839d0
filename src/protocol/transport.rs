use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use bincode::{Decode, Encode};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, TransportError};

use super::{Frame, VALUE_SIZE, handshake};

/// Largest handshake datagram accepted.
const MAX_DATAGRAM: usize = 65_507;

/// Connection mode of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Reliable, ordered byte stream (TCP).
    #[default]
    Stream,
    /// One message per datagram (UDP); no ordering or delivery guarantee.
    Datagram,
}

/// Network address of a site plus its security flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    pub fn resolve(&self) -> Result<SocketAddr, ConnectionError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| ConnectionError::Resolve(self.to_string()))?
            .next()
            .ok_or_else(|| ConnectionError::Resolve(self.to_string()))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        Endpoint::new(value.ip().to_string(), value.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

enum Link {
    Stream(TcpStream),
    /// Connected socket; `send`/`recv` talk to the single peer.
    Datagram(UdpSocket),
}

/// One end of a trial/response channel.
///
/// A session carries fixed-width frames whose size (`payload_size` doubles) both peers
/// agree on during the handshake. Every receive is bounded by the session deadline, if
/// one is set. Closing is idempotent and also happens on drop.
pub struct Session {
    peer: String,
    mode: TransportMode,
    payload_size: usize,
    deadline: Option<Duration>,
    site_id: Option<String>,
    setup_id: Option<String>,
    link: Option<Link>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("mode", &self.mode)
            .field("payload_size", &self.payload_size)
            .field("deadline", &self.deadline)
            .field("site_id", &self.site_id)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl Session {
    /// Connects to `endpoint`.
    pub fn open(
        endpoint: &Endpoint,
        mode: TransportMode,
        payload_size: usize,
        deadline: Option<Duration>,
    ) -> Result<Self, ConnectionError> {
        if endpoint.secure {
            return Err(ConnectionError::SecureUnavailable(endpoint.to_string()));
        }
        let addr = endpoint.resolve()?;
        let refused = |source| ConnectionError::Refused {
            endpoint: endpoint.to_string(),
            source,
        };

        let link = match mode {
            TransportMode::Stream => {
                let stream = match deadline {
                    Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                    None => TcpStream::connect(addr),
                }
                .map_err(refused)?;
                stream.set_nodelay(true)?;
                Link::Stream(stream)
            }
            TransportMode::Datagram => {
                let local: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(addr).map_err(refused)?;
                Link::Datagram(socket)
            }
        };
        debug!("opened {mode:?} session to {endpoint}");

        Ok(Self {
            peer: endpoint.to_string(),
            mode,
            payload_size,
            deadline,
            site_id: None,
            setup_id: None,
            link: Some(link),
        })
    }

    /// Wraps an accepted stream connection.
    pub fn from_stream(stream: TcpStream, payload_size: usize) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Ok(Self {
            peer,
            mode: TransportMode::Stream,
            payload_size,
            deadline: None,
            site_id: None,
            setup_id: None,
            link: Some(Link::Stream(stream)),
        })
    }

    /// Wraps a datagram socket already connected to its peer.
    pub fn from_datagram(socket: UdpSocket, payload_size: usize) -> io::Result<Self> {
        let peer = socket.peer_addr()?.to_string();
        Ok(Self {
            peer,
            mode: TransportMode::Datagram,
            payload_size,
            deadline: None,
            site_id: None,
            setup_id: None,
            link: Some(Link::Datagram(socket)),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn set_payload_size(&mut self, payload_size: usize) {
        self.payload_size = payload_size;
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.deadline = deadline;
    }

    pub fn site_id(&self) -> Option<&str> {
        self.site_id.as_deref()
    }

    pub fn setup_id(&self) -> Option<&str> {
        self.setup_id.as_deref()
    }

    /// Records which site and setup answer on this session.
    pub fn set_identity(&mut self, site_id: impl Into<String>, setup_id: impl Into<String>) {
        self.site_id = Some(site_id.into());
        self.setup_id = Some(setup_id.into());
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::Closed)?;
        match link {
            Link::Stream(stream) => {
                let mut written = 0;
                while written < bytes.len() {
                    match stream.write(&bytes[written..]) {
                        Ok(0) => {
                            return Err(TransportError::ShortWrite {
                                expected: bytes.len(),
                                written,
                            });
                        }
                        Ok(n) => written += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                stream.flush()?;
            }
            Link::Datagram(socket) => {
                let written = socket.send(bytes)?;
                if written != bytes.len() {
                    return Err(TransportError::ShortWrite {
                        expected: bytes.len(),
                        written,
                    });
                }
            }
        }
        trace!("sent {} bytes to {}", bytes.len(), self.peer);
        Ok(())
    }

    /// Receives exactly `expected_len` bytes, bounded by the session deadline.
    pub fn receive(&mut self, expected_len: usize) -> Result<Vec<u8>, TransportError> {
        let deadline = self.deadline;
        let link = self.link.as_mut().ok_or(TransportError::Closed)?;
        let timed_out = || TransportError::Timeout {
            waited: deadline.unwrap_or_default(),
        };

        let bytes = match link {
            Link::Stream(stream) => {
                let started = Instant::now();
                let mut buf = vec![0_u8; expected_len];
                let mut filled = 0;
                while filled < expected_len {
                    match deadline {
                        Some(limit) => {
                            let remaining = limit.saturating_sub(started.elapsed());
                            if remaining.is_zero() {
                                return Err(timed_out());
                            }
                            stream.set_read_timeout(Some(remaining))?;
                        }
                        None => stream.set_read_timeout(None)?,
                    }

                    match stream.read(&mut buf[filled..]) {
                        Ok(0) if filled == 0 => return Err(TransportError::PeerClosed),
                        Ok(0) => {
                            return Err(TransportError::ShortRead {
                                expected: expected_len,
                                received: filled,
                            });
                        }
                        Ok(n) => filled += n,
                        Err(e) if is_timeout(&e) => return Err(timed_out()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if is_reset(&e) => return Err(TransportError::PeerClosed),
                        Err(e) => return Err(e.into()),
                    }
                }
                buf
            }
            Link::Datagram(socket) => {
                socket.set_read_timeout(deadline)?;
                // One spare byte so oversized datagrams are detected, not truncated.
                let mut buf = vec![0_u8; expected_len + 1];
                let received = match socket.recv(&mut buf) {
                    Ok(n) => n,
                    Err(e) if is_timeout(&e) => return Err(timed_out()),
                    Err(e) => return Err(e.into()),
                };
                if received == 0 {
                    return Err(TransportError::PeerClosed);
                }
                if received != expected_len {
                    return Err(TransportError::ShortRead {
                        expected: expected_len,
                        received,
                    });
                }
                buf.truncate(expected_len);
                buf
            }
        };
        trace!("received {} bytes from {}", bytes.len(), self.peer);
        Ok(bytes)
    }

    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.send(&frame.encode())
    }

    /// Receives a frame of `count` values.
    pub fn receive_frame(&mut self, count: usize) -> Result<Frame, TransportError> {
        let bytes = self.receive(count * VALUE_SIZE)?;
        Frame::decode(&bytes, count)
    }

    /// Sends a bincode-encoded handshake message.
    pub fn send_hello<T: Encode>(&mut self, message: &T) -> Result<(), TransportError> {
        let bytes = handshake::encode(message)?;
        match self.link.as_mut().ok_or(TransportError::Closed)? {
            Link::Stream(stream) => {
                stream.write_all(&bytes)?;
                stream.flush()?;
            }
            Link::Datagram(socket) => {
                socket.send(&bytes)?;
            }
        }
        Ok(())
    }

    /// Receives a bincode-encoded handshake message.
    pub fn receive_hello<T: Decode<()>>(&mut self) -> Result<T, TransportError> {
        let deadline = self.deadline;
        match self.link.as_mut().ok_or(TransportError::Closed)? {
            Link::Stream(stream) => {
                stream.set_read_timeout(deadline)?;
                let message = bincode::decode_from_std_read(stream, handshake::config())?;
                Ok(message)
            }
            Link::Datagram(socket) => {
                socket.set_read_timeout(deadline)?;
                let mut buf = vec![0_u8; MAX_DATAGRAM];
                let received = match socket.recv(&mut buf) {
                    Ok(n) => n,
                    Err(e) if is_timeout(&e) => {
                        return Err(TransportError::Timeout {
                            waited: deadline.unwrap_or_default(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                if received == 0 {
                    return Err(TransportError::PeerClosed);
                }
                handshake::decode(&buf[..received])
            }
        }
    }

    /// Closes the session. Safe to call repeatedly and after failures.
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            if let Link::Stream(stream) = link {
                let _ = stream.shutdown(Shutdown::Both);
            }
            debug!("closed session with {}", self.peer);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn is_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}
