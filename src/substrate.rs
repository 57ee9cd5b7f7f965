//! Collaborator contract with the generic gossip substrate.
//!
//! The relay engine does not own transport, peer discovery, scoring, or the
//! recent-message cache; it consumes them through [`GossipSubstrate`]. The
//! trait is the composition seam: the engine supplies relay policy (peer
//! eligibility, prune payloads, gossip emission) and the substrate supplies
//! mechanism (registries, scores, frame delivery).
//!
//! Registry and score reads are synchronous: the substrate is expected to
//! serve them from its own thread-safe state. Network sends are async and
//! are spawned by the engine so one slow peer never stalls another.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;

use crate::messages::{content_id, ControlMessage, MessageId, RelayMessage};
use crate::peer::PeerId;

/// Pubsub topic the engine subscribes to and publishes on by default.
pub const DEFAULT_PUBSUB_TOPIC: &str = "/waku/2/default-waku/proto";

/// Protocol identifier peers must have negotiated to take part in the mesh.
pub const RELAY_PROTOCOL_ID: &str = "/vac/waku/relay/2.0.0-beta2";

/// Fraction of eligible peers to gossip IHAVE to per emission.
pub const RELAY_GOSSIP_FACTOR: f64 = 0.25;

/// PRUNE backoff, in milliseconds. Converted to whole seconds on the wire.
pub const RELAY_PRUNE_BACKOFF_MS: u64 = 60 * 1000;

/// Maximum peers carried in a PRUNE peer-exchange payload.
pub const RELAY_PRUNE_PEERS: usize = 16;

/// Maximum message ids per IHAVE advertisement.
pub const RELAY_MAX_IHAVE_LENGTH: usize = 5000;

/// How long a fanout peer set stays warm without a publish.
pub const RELAY_FANOUT_TTL: Duration = Duration::from_secs(60);

/// D - target mesh degree per topic.
pub const DEFAULT_D: usize = 6;
/// D_lo - lower bound before the heartbeat grafts more peers.
pub const DEFAULT_D_LO: usize = 5;
/// D_hi - upper bound before the heartbeat prunes excess peers.
pub const DEFAULT_D_HI: usize = 12;
/// D_score - mesh slots reserved for high-scoring peers.
pub const DEFAULT_D_SCORE: usize = 4;
/// D_out - minimum outbound links kept in the mesh.
pub const DEFAULT_D_OUT: usize = 2;
/// D_lazy - minimum peers gossiped to per emission.
pub const DEFAULT_D_LAZY: usize = 6;

/// Score cutoffs gating publish, gossip, and message acceptance.
#[derive(Clone, Copy, Debug)]
pub struct ScoreThresholds {
    /// Below this, a peer receives no published messages.
    pub publish_threshold: f64,
    /// Below this, a peer receives no IHAVE gossip.
    pub gossip_threshold: f64,
    /// Below this, the substrate drops the peer's messages entirely.
    pub graylist_threshold: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            publish_threshold: -50.0,
            gossip_threshold: -25.0,
            graylist_threshold: -100.0,
        }
    }
}

/// Engine configuration. The pubsub topic is injected here once; no other
/// component carries its own copy of the default.
#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub pubsub_topic: String,
    pub d: usize,
    pub d_lo: usize,
    pub d_hi: usize,
    pub d_score: usize,
    pub d_out: usize,
    pub d_lazy: usize,
    pub gossip_factor: f64,
    pub prune_peers: usize,
    pub max_ihave_length: usize,
    pub prune_backoff: Duration,
    pub fanout_ttl: Duration,
    /// Whether PRUNE messages carry peer exchange.
    pub do_px: bool,
    /// Peers always flooded to, regardless of mesh membership or score.
    pub direct_peers: Vec<PeerId>,
    pub thresholds: ScoreThresholds,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            pubsub_topic: DEFAULT_PUBSUB_TOPIC.to_string(),
            d: DEFAULT_D,
            d_lo: DEFAULT_D_LO,
            d_hi: DEFAULT_D_HI,
            d_score: DEFAULT_D_SCORE,
            d_out: DEFAULT_D_OUT,
            d_lazy: DEFAULT_D_LAZY,
            gossip_factor: RELAY_GOSSIP_FACTOR,
            prune_peers: RELAY_PRUNE_PEERS,
            max_ihave_length: RELAY_MAX_IHAVE_LENGTH,
            prune_backoff: Duration::from_millis(RELAY_PRUNE_BACKOFF_MS),
            fanout_ttl: RELAY_FANOUT_TTL,
            do_px: false,
            direct_peers: Vec::new(),
            thresholds: ScoreThresholds::default(),
        }
    }
}

/// Services the relay engine consumes from the gossip substrate.
#[async_trait]
pub trait GossipSubstrate: Send + Sync + 'static {
    /// Peers currently subscribed to a topic.
    fn peers_in_topic(&self, topic: &str) -> Vec<PeerId>;

    /// The pubsub protocol this peer negotiated, if any.
    fn peer_protocol(&self, peer: &PeerId) -> Option<String>;

    /// Current reputation score for a peer.
    fn score(&self, peer: &PeerId) -> f64;

    /// Raw signed address record for a peer, when the local address book
    /// holds one.
    fn signed_record(&self, peer: &PeerId) -> Option<Vec<u8>>;

    /// Announce interest in a topic at the substrate level.
    fn subscribe(&self, topic: &str);

    /// Credit delivery bookkeeping (score credit, dedup trace) for a
    /// remotely-originated message.
    fn record_delivery(&self, message: &RelayMessage);

    /// Insert into the bounded seen-message cache.
    fn mark_seen(&self, id: MessageId);

    /// Insert into the bounded recent-message cache.
    fn cache_message(&self, id: MessageId, message: &RelayMessage);

    /// Recently cached message ids for a topic, for IHAVE advertisement.
    fn gossip_message_ids(&self, topic: &str) -> Vec<MessageId>;

    /// Deduplication identity of a message, derived from its bytes.
    fn message_id(&self, message: &RelayMessage) -> MessageId {
        content_id(&message.data)
    }

    /// Deliver a full message frame to one peer.
    async fn forward(&self, to: PeerId, message: RelayMessage) -> Result<()>;

    /// Deliver a control message to one peer.
    async fn send_control(&self, to: PeerId, control: ControlMessage) -> Result<()>;
}

/// Default capacity of [`MessageCache`].
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 10_000;

/// Default time-to-live for cached messages.
pub const DEFAULT_MESSAGE_CACHE_TTL: Duration = Duration::from_secs(120);

struct CachedMessage {
    topics: Vec<String>,
    data: Vec<u8>,
    cached_at: Instant,
}

/// Bounded, TTL-evicted recent-message cache for substrate implementations.
///
/// Not internally synchronized; wrap in the substrate's own lock. The
/// capacity bound is enforced by LRU eviction, the TTL lazily on read.
pub struct MessageCache {
    entries: LruCache<MessageId, CachedMessage>,
    ttl: Duration,
}

impl MessageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn put(&mut self, id: MessageId, message: &RelayMessage) {
        self.entries.put(
            id,
            CachedMessage {
                topics: message.topics.clone(),
                data: message.data.clone(),
                cached_at: Instant::now(),
            },
        );
    }

    pub fn get(&mut self, id: &MessageId) -> Option<&[u8]> {
        let ttl = self.ttl;
        self.entries
            .get(id)
            .filter(|entry| entry.cached_at.elapsed() <= ttl)
            .map(|entry| entry.data.as_slice())
    }

    /// Non-expired message ids cached for a topic.
    pub fn gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.cached_at.elapsed() <= self.ttl
                    && entry.topics.iter().any(|t| t == topic)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop expired entries eagerly. Callers run this from their heartbeat.
    pub fn purge_expired(&mut self) {
        let expired: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.cached_at.elapsed() > self.ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.entries.pop(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
