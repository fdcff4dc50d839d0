//! Error taxonomy for the coordination protocol.
//!
//! Each concern of the exchange has its own error type so callers can tell a refused
//! connection from a late reply, a misbehaving peer from a bad configuration file:
//!
//! - [`ConnectionError`]: the session could not be established or was lost.
//! - [`TransportError`]: a single send/receive failed (short read, timeout, ...).
//! - [`ProtocolError`]: both peers are reachable but the exchange broke its rules.
//! - [`ConfigurationError`]: detected before the first trial is exchanged.
//! - [`ElementError`]: numerically invalid trial or response values.
//! - [`BackendError`]: the control backend refused or failed a command.
//!
//! [`Error`] wraps all of them for APIs that may fail in more than one way.
use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::Sequence;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to resolve endpoint '{0}'")]
    Resolve(String),

    #[error("failed to connect to '{endpoint}': {source}")]
    Refused {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("secure transport requested for '{0}' but no TLS layer is available")]
    SecureUnavailable(String),

    #[error("site rejected the session: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(#[from] TransportError),

    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {waited:?}")]
    Timeout { waited: Duration },

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("peer closed the session")]
    PeerClosed,

    #[error("session is closed")]
    Closed,

    #[error("failed to encode handshake: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode handshake: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("trial {pending} is still waiting for its response")]
    TrialOutstanding { pending: Sequence },

    #[error("no trial is waiting for a response")]
    NoPendingTrial,

    #[error("out-of-order sequence: expected {expected}, received {received}")]
    OutOfOrder {
        expected: Sequence,
        received: Sequence,
    },

    #[error("commit for {received} without a preceding answered trial")]
    CommitWithoutTrial { received: Sequence },

    #[error("duplicate trial {sequence} carries different values")]
    ConflictingDuplicate { sequence: Sequence },

    #[error("message carries {received} values, session agreed on {expected}")]
    SizeMismatch { expected: usize, received: usize },

    #[error("unknown action code {0}")]
    UnknownAction(f64),

    #[error("unknown status code {0}")]
    UnknownStatus(f64),

    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("reply answers request {received}, expected {expected}")]
    UnmatchedReply { expected: u64, received: u64 },

    #[error("site reported failure ({kind}) at {sequence}")]
    SiteFailed { kind: FailureKind, sequence: Sequence },

    #[error("site is closed")]
    Closed,
}

/// Failure category carried in a failed status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Protocol,
    Configuration,
    Element,
    Backend,
    Unknown,
}

impl FailureKind {
    pub fn code(self) -> f64 {
        match self {
            FailureKind::Protocol => 1.0,
            FailureKind::Configuration => 2.0,
            FailureKind::Element => 3.0,
            FailureKind::Backend => 4.0,
            FailureKind::Unknown => 0.0,
        }
    }

    pub fn from_code(code: f64) -> Self {
        match code as i64 {
            1 => FailureKind::Protocol,
            2 => FailureKind::Configuration,
            3 => FailureKind::Element,
            4 => FailureKind::Backend,
            _ => FailureKind::Unknown,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Protocol => "protocol",
            FailureKind::Configuration => "configuration",
            FailureKind::Element => "element",
            FailureKind::Backend => "backend",
            FailureKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("control point '{0}' has a zero or non-finite scale factor")]
    InvalidScaleFactor(String),

    #[error("control point '{id}' has lower limit {lower} above upper limit {upper}")]
    InvertedLimits { id: String, lower: f64, upper: f64 },

    #[error("unknown control point '{0}'")]
    UnknownControlPoint(String),

    #[error("control point '{0}' is registered twice")]
    DuplicateControlPoint(String),

    #[error("{what}: expected {expected} values, received {received}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        received: usize,
    },

    #[error("payload of {payload} doubles cannot carry {required}")]
    PayloadTooSmall { required: usize, payload: usize },

    #[error("backend exposes {available} {kind} channels, setup needs {required}")]
    ChannelCount {
        kind: &'static str,
        available: usize,
        required: usize,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ElementError {
    #[error("{what}[{index}] is not finite ({value})")]
    NonFinite {
        what: &'static str,
        index: usize,
        value: f64,
    },

    #[error("{what}: expected {expected} values, received {received}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        received: usize,
    },

    #[error("site rejected the values exchanged at {sequence} as non-finite")]
    RejectedBySite { sequence: Sequence },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend '{backend}' cannot handle {kind} signals")]
    UnsupportedQuantity { backend: String, kind: &'static str },

    #[error("backend '{0}' cannot revert to the last committed state")]
    RevertUnsupported(String),

    #[error("backend '{backend}' expects {expected} channels, received {received}")]
    ChannelMismatch {
        backend: String,
        expected: usize,
        received: usize,
    },

    #[error("controller rejected the command: {0}")]
    Controller(String),

    #[error("controller link failed: {0}")]
    Link(#[from] TransportError),

    #[error("backend lock poisoned")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Element(#[from] ElementError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl Error {
    /// Category reported to the peer when a site answers with a failed status.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::Protocol(_) => FailureKind::Protocol,
            Error::Configuration(_) => FailureKind::Configuration,
            Error::Element(_) => FailureKind::Element,
            Error::Backend(_) => FailureKind::Backend,
            Error::Connection(_) | Error::Transport(_) => FailureKind::Unknown,
        }
    }
}

/// Rejects the first non-finite entry of `values`.
pub(crate) fn ensure_finite(what: &'static str, values: &[f64]) -> Result<(), ElementError> {
    match values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        Some((index, value)) => Err(ElementError::NonFinite {
            what,
            index,
            value: *value,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_codes() {
        for kind in [
            FailureKind::Protocol,
            FailureKind::Configuration,
            FailureKind::Element,
            FailureKind::Backend,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), kind);
        }
        assert_eq!(FailureKind::from_code(42.0), FailureKind::Unknown);
    }

    #[test]
    fn finite_values_pass() {
        assert!(ensure_finite("trial", &[0.0, -1.5, 1e300]).is_ok());
    }

    #[test]
    #[should_panic(expected = "NonFinite")]
    fn nan_is_rejected() {
        ensure_finite("trial", &[0.0, f64::NAN]).unwrap();
    }
}
