use crate::error::TransportError;

/// Size in bytes of one value on the wire.
pub const VALUE_SIZE: usize = size_of::<f64>();

/// Fixed-width message: a run of native-endian doubles.
///
/// There is no length prefix; both peers agree on the value count when the session is
/// set up, and a frame of any other size is a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    values: Vec<f64>,
}

impl Frame {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Frame of `len` zeros.
    pub fn zeroed(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn byte_len(&self) -> usize {
        self.values.len() * VALUE_SIZE
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f64> {
        self.values
    }

    pub fn encode(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    /// Decodes exactly `count` values from `bytes`.
    pub fn decode(bytes: &[u8], count: usize) -> Result<Self, TransportError> {
        let expected = count * VALUE_SIZE;
        if bytes.is_empty() && expected > 0 {
            return Err(TransportError::PeerClosed);
        }
        if bytes.len() != expected {
            return Err(TransportError::ShortRead {
                expected,
                received: bytes.len(),
            });
        }

        let values = bytes
            .chunks_exact(VALUE_SIZE)
            .map(|chunk| {
                let mut raw = [0_u8; VALUE_SIZE];
                raw.copy_from_slice(chunk);
                f64::from_ne_bytes(raw)
            })
            .collect();
        Ok(Self { values })
    }
}

impl From<Vec<f64>> for Frame {
    fn from(value: Vec<f64>) -> Self {
        Frame::new(value)
    }
}
