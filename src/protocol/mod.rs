//! Wire protocol between an analysis element and an experimental site.
//!
//! A session starts with a typed handshake and then exchanges fixed-width frames of
//! native-endian doubles.
//!
//! # Handshake
//!
//! The element sends a [`Hello`] naming itself, its degree-of-freedom count and the
//! frame width it wants. The site answers with a [`HelloReply`]: either the layout of
//! its trial and daq vectors plus its capabilities, or a rejection. Handshake messages
//! are bincode-encoded, big-endian with fixed-width integers.
//!
//! # Frames
//!
//! Every later message is a [`Frame`] of exactly `payload_size` doubles:
//!
//! ```text
//! [ code | request id | step | iteration | values ... | zero padding ]
//! ```
//!
//! Requests carry an [`Action`] code, replies a [`Status`] code and the id of the
//! [`Request`] they answer, so a late reply is never mistaken for the answer to a
//! later request. A trial frame carries
//! the trial vector, a completed reply the daq response vector. The frame has no length
//! prefix, so the payload size must cover the header plus the longer of the two vectors.
//!
//! # Transport
//!
//! A [`Session`] runs over a stream (TCP) or over datagrams (UDP). Each receive is
//! bounded by an optional deadline; a frame arriving late is reported as a timeout,
//! never waited for indefinitely.
mod frame;
mod handshake;
mod message;
mod thread;
mod transport;

pub(crate) use thread::ThreadPool;

pub use frame::{Frame, VALUE_SIZE};
pub use handshake::{Hello, HelloReply};
pub use message::{
    Action, HEADER_LEN, Message, Reply, Request, ResponseVector, Sequence, Status, TrialVector,
};
pub use transport::{Endpoint, Session, TransportMode};

pub(crate) use handshake::{MAX_HELLO, decode as decode_hello};

/// Smallest frame width that carries both vectors of a site.
pub fn required_payload(trial_size: usize, daq_size: usize) -> usize {
    HEADER_LEN + trial_size.max(daq_size)
}
