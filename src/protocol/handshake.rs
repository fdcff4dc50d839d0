use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
};

use crate::{backend::Capabilities, error::TransportError, site::SiteLayout};

/// Opening message of a session, sent by the solver side.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Hello {
    pub element_id: u32,
    /// Number of degrees of freedom the element exposes; layout dofs must be below it.
    pub dof_count: u32,
    /// Doubles per exchange frame the element intends to use.
    pub payload_size: u32,
}

/// Site answer to a [`Hello`].
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum HelloReply {
    Accepted {
        site_id: String,
        setup_id: String,
        layout: SiteLayout,
        capabilities: Capabilities,
    },
    Rejected {
        reason: String,
    },
}

/// Largest handshake message, the payload of one UDP datagram.
pub(crate) const MAX_HELLO: usize = 65_507;

pub(crate) fn config() -> Configuration<BigEndian, Fixint, Limit<MAX_HELLO>> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_HELLO>()
}

pub(crate) fn encode<T: Encode>(message: &T) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::encode_to_vec(message, config())?)
}

pub(crate) fn decode<T: Decode<()>>(bytes: &[u8]) -> Result<T, TransportError> {
    let (message, _) = bincode::decode_from_slice(bytes, config())?;
    Ok(message)
}
