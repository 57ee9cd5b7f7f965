//! # Wisp - Gossip Relay and Light Push
//!
//! Wisp implements topic-based epidemic message dissemination for
//! resource-aware p2p networks:
//!
//! - **Relay**: GossipSub-style mesh routing with fanout publishing,
//!   score-gated peer selection, IHAVE gossip, and prune-time peer exchange
//! - **Light Push**: request/response message injection for nodes too
//!   constrained to participate in the mesh
//! - **Envelopes**: versioned, content-topic-tagged message payloads with
//!   strict decode rejection
//!
//! ## Architecture
//!
//! The relay uses the **Actor Pattern** for safe concurrent state:
//! - [`Relay`] is a cheap-to-clone public handle; a private actor owns all
//!   mutable state and processes commands sequentially
//! - Per-peer network sends are spawned tasks, so one slow peer never
//!   stalls the engine
//! - Transport, peer discovery, scoring, and caching are injected through
//!   the [`GossipSubstrate`] and [`PushTransport`] composition seams
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `relay` | Mesh/fanout engine, observer dispatch, gossip and prune policy |
//! | `light_push` | Push client, stream responder, and wire framing |
//! | `envelope` | Content-topic-tagged message payload codec |
//! | `push_rpc` | Light-push request/response correlation envelope |
//! | `substrate` | Substrate contract, engine configuration, message cache |
//! | `messages` | Wire types and bounded serialization |
//! | `peers` | Bounded random peer selection |
//! | `peer` | Peer identifiers and peer-exchange records |

mod envelope;
mod light_push;
mod messages;
mod peer;
mod peers;
mod push_rpc;
mod relay;
mod substrate;

pub use envelope::{CodecError, MessageEnvelope, DEFAULT_CONTENT_TOPIC, DEFAULT_VERSION};
pub use light_push::{
    serve_stream, LightPush, PeerRecord, PushError, PushStream, PushTransport,
    LIGHT_PUSH_PROTOCOL_ID,
};
pub use messages::{content_id, ControlMessage, MessageId, RelayMessage, MAX_WIRE_SIZE};
pub use peer::{PeerExchangeInfo, PeerId};
pub use peers::select_relay_peers;
pub use push_rpc::{PushRequest, PushResponse, PushRpc};
pub use relay::{Observer, ObserverScope, Relay, RelayError};
pub use substrate::{
    GossipSubstrate, MessageCache, RelayOptions, ScoreThresholds, DEFAULT_D, DEFAULT_D_HI,
    DEFAULT_D_LAZY, DEFAULT_D_LO, DEFAULT_D_OUT, DEFAULT_D_SCORE, DEFAULT_MESSAGE_CACHE_SIZE,
    DEFAULT_MESSAGE_CACHE_TTL, DEFAULT_PUBSUB_TOPIC, RELAY_FANOUT_TTL, RELAY_GOSSIP_FACTOR,
    RELAY_MAX_IHAVE_LENGTH, RELAY_PROTOCOL_ID, RELAY_PRUNE_BACKOFF_MS, RELAY_PRUNE_PEERS,
};
