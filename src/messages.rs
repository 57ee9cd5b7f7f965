//! Wire types shared by the relay engine and its substrate.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`RelayMessage`] | A topic-tagged frame travelling through the mesh |
//! | [`ControlMessage`] | GRAFT / PRUNE / IHAVE mesh control traffic |
//! | [`MessageId`] | 32-byte content-derived deduplication identifier |
//!
//! Serialization is bincode; the hard size limit applies on the read side
//! only. Always deserialize through [`deserialize_bounded`] so oversized
//! input fails instead of allocating. The options reject trailing bytes,
//! which is what gives the envelope codec its unknown-input rejection.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::{PeerExchangeInfo, PeerId};

/// 32-byte deduplication identifier, derived from encoded message bytes.
pub type MessageId = [u8; 32];

/// Maximum wire size for any single frame (1 MiB).
pub const MAX_WIRE_SIZE: usize = 1024 * 1024;

/// Deserialization buffer limit: wire size plus framing slack.
const MAX_DESERIALIZE_SIZE: u64 = (MAX_WIRE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

fn bounded_options() -> impl Options {
    bincode_options().with_limit(MAX_DESERIALIZE_SIZE)
}

/// Serialize a wire type. No size limit applies here: oversized frames
/// are refused at the framing layer, not during encoding. Infallible for
/// the types in this crate, which contain no non-serializable states.
pub(crate) fn serialize<T: Serialize>(value: &T) -> Vec<u8> {
    bincode_options()
        .serialize(value)
        .expect("wire types serialize infallibly")
}

/// Deserialize with size bounds enforced and trailing bytes rejected.
pub(crate) fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bounded_options().deserialize(bytes)
}

/// Derive a [`MessageId`] from encoded message bytes.
pub fn content_id(data: &[u8]) -> MessageId {
    *blake3::hash(data).as_bytes()
}

/// A message moving through the relay, as handed over by the substrate.
///
/// `from` is the declared originator; `received_from` is the neighbor the
/// frame actually arrived from (equal to the local peer for local sends).
/// The distinction drives delivery bookkeeping and the no-retransmit-to-
/// originator rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayMessage {
    pub from: PeerId,
    pub received_from: PeerId,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
}

impl RelayMessage {
    /// Build a locally-originated message on a single topic.
    pub fn local(local: PeerId, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            from: local,
            received_from: local,
            topics: vec![topic.into()],
            data,
        }
    }
}

/// Mesh control traffic sent peer-to-peer through the substrate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Request a bidirectional mesh link for a topic.
    Graft { topic: String },
    /// Drop a mesh link, with a re-graft backoff and optional peer exchange.
    Prune {
        topic: String,
        peers: Vec<PeerExchangeInfo>,
        backoff_secs: u64,
    },
    /// Advertise recently seen message identifiers for a topic.
    IHave {
        topic: String,
        message_ids: Vec<MessageId>,
    },
}

impl ControlMessage {
    pub fn topic(&self) -> &str {
        match self {
            Self::Graft { topic } => topic,
            Self::Prune { topic, .. } => topic,
            Self::IHave { topic, .. } => topic,
        }
    }
}
