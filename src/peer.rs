//! Peer identifiers and peer-exchange records.
//!
//! A [`PeerId`] is an opaque 32-byte identifier assigned by the underlying
//! transport. This crate never derives identity from keys; it only routes
//! by identifier and consults the substrate for everything else (scores,
//! negotiated protocols, signed address records).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque 32-byte peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// One peer-exchange entry carried in a PRUNE control message.
///
/// The signed record is the raw envelope from the local address book when
/// one is known. Without a record the pruned peer must rediscover the
/// address on its own; unsigned addresses are not worth forwarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerExchangeInfo {
    pub peer: PeerId,
    pub signed_record: Option<Vec<u8>>,
}
