//! Reference echo application.
//!
//! Reads `(time, data, flag)` requests of three doubles and answers each with four
//! copies of `data * 2 + flag`, until the peer closes the connection. Used to check a
//! client's framing against a known peer.
use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
};

use log::{info, warn};

use crate::{
    error::TransportError,
    protocol::{Frame, Session, ThreadPool},
};

pub const REQUEST_LEN: usize = 3;
pub const REPLY_LEN: usize = 4;

pub fn echo_reply(request: &[f64]) -> Vec<f64> {
    let value = request[1] * 2.0 + request[2];
    vec![value; REPLY_LEN]
}

pub struct EchoServer {
    listener: TcpListener,
    pool: ThreadPool,
}

impl EchoServer {
    pub fn bind<A: ToSocketAddrs>(address: A, workers: usize) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            pool: ThreadPool::new(workers.max(1)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves a single connection on the calling thread; returns the number of requests
    /// answered.
    pub fn serve_one(&self) -> Result<usize, TransportError> {
        let (stream, peer) = self.listener.accept()?;
        info!("echo client connected from {peer}");
        handle_connection(stream)
    }

    /// Accepts connections forever, one worker per connection.
    pub fn listen(self) -> Result<(), TransportError> {
        info!("echo server listening at {}", self.listener.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.pool.execute(move || match handle_connection(stream) {
                    Ok(count) => info!("echo connection closed after {count} requests"),
                    Err(e) => warn!("echo connection failed: {e}"),
                }),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream) -> Result<usize, TransportError> {
    let mut session = Session::from_stream(stream, REQUEST_LEN)?;
    let mut answered = 0;

    loop {
        let request = match session.receive_frame(REQUEST_LEN) {
            Ok(frame) => frame,
            Err(TransportError::PeerClosed) => return Ok(answered),
            Err(e) => return Err(e),
        };
        let reply = Frame::new(echo_reply(request.values()));
        session.send_frame(&reply)?;
        answered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_doubles_data_and_adds_flag() {
        assert_eq!(echo_reply(&[1.0, 2.0, 0.5]), vec![4.5; 4]);
        assert_eq!(echo_reply(&[0.0, -1.0, 0.0]), vec![-2.0; 4]);
    }
}
