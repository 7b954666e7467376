use bytes::Bytes;
use thiserror::Error;

/// Length of the Ethernet II header: dst MAC, src MAC, ethertype.
pub const ETH_HDR_LEN: usize = 14;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed ethernet frame: {0} bytes (need at least {ETH_HDR_LEN})")]
    Malformed(usize),
}

/// One immutable Ethernet frame.
///
/// Construction copies the caller's buffer so the source may be reused;
/// accessors are zero-copy views into the shared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    /// Copies `buf` into a new frame. Fails unless a full Ethernet header
    /// is present.
    pub fn copy_from(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < ETH_HDR_LEN {
            return Err(FrameError::Malformed(buf.len()));
        }
        Ok(Self {
            data: Bytes::copy_from_slice(buf),
        })
    }

    pub fn dst(&self) -> &[u8] {
        &self.data[0..6]
    }

    pub fn src(&self) -> &[u8] {
        &self.data[6..12]
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.data[12], self.data[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[ETH_HDR_LEN..]
    }

    pub fn parse_eth(&self) -> (u16, &[u8]) {
        (self.ethertype(), self.payload())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl TryFrom<Vec<u8>> for Frame {
    type Error = FrameError;

    /// Takes ownership of an already-assembled buffer without copying.
    fn try_from(buf: Vec<u8>) -> Result<Self, FrameError> {
        if buf.len() < ETH_HDR_LEN {
            return Err(FrameError::Malformed(buf.len()));
        }
        Ok(Self {
            data: Bytes::from(buf),
        })
    }
}

/// Renders a MAC address slice as `aa:bb:cc:dd:ee:ff`.
pub fn mac_string(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}
