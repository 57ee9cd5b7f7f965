//! The relay engine: mesh and fanout management, the publish path, gossip
//! emission policy, prune construction, and observer dispatch.
//!
//! ## Architecture
//!
//! [`Relay`] is a cheap-to-clone handle; a private `RelayActor` owns every
//! piece of mutable state (mesh, fanout, last-publish times, observers) and
//! processes commands sequentially from an mpsc channel. Inbound frames,
//! local sends, and heartbeat-driven gossip emission are therefore all
//! serialized against the peer-set state, while per-peer network sends are
//! spawned tasks that never wait on one another.
//!
//! ## Per-topic state
//!
//! | Set | Meaning |
//! |-----|---------|
//! | mesh | Peers flooded with full messages for a subscribed topic |
//! | fanout | Warm peer set for publishing into a topic we have not joined |
//!
//! Joining a topic promotes its fanout set (score-filtered and backfilled
//! to degree D) into the mesh; a topic never holds both sets at once.
//!
//! Policy decisions live here; mechanism (registries, scores, caches, frame
//! delivery) is consumed through [`GossipSubstrate`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::envelope::MessageEnvelope;
use crate::messages::{ControlMessage, RelayMessage};
use crate::peer::{PeerExchangeInfo, PeerId};
use crate::peers::select_relay_peers;
use crate::substrate::{GossipSubstrate, RelayOptions, RELAY_PROTOCOL_ID};

/// Command channel depth between handle and actor.
const COMMAND_BUFFER: usize = 1000;

/// Engine-usage precondition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// The engine has not been started.
    NotStarted,
    /// The engine was stopped and no longer accepts operations.
    Stopped,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "relay engine has not started"),
            Self::Stopped => write!(f, "relay engine has stopped"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Observer callback invoked with each decoded envelope.
pub type Observer = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Registration scope for an observer: every message, or only messages
/// tagged with one content topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObserverScope {
    Any,
    Topic(String),
}

/// Ordered observer registry. Catch-all observers always run before
/// topic-scoped ones; within a scope, registration order is dispatch order.
#[derive(Default)]
struct ObserverRegistry {
    any: Vec<Observer>,
    by_topic: HashMap<String, Vec<Observer>>,
}

impl ObserverRegistry {
    fn register(&mut self, scope: ObserverScope, callback: Observer) {
        match scope {
            ObserverScope::Any => self.any.push(callback),
            ObserverScope::Topic(topic) => {
                self.by_topic.entry(topic).or_default().push(callback)
            }
        }
    }

    fn dispatch(&self, envelope: &MessageEnvelope) {
        for callback in &self.any {
            callback(envelope);
        }
        if let Some(topic) = envelope.content_topic() {
            if let Some(callbacks) = self.by_topic.get(topic) {
                for callback in callbacks {
                    callback(envelope);
                }
            }
        }
    }
}

enum Command {
    Start(oneshot::Sender<Result<(), RelayError>>),
    Publish {
        pubsub_topic: Option<String>,
        envelope: MessageEnvelope,
        deliver_local: bool,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Process {
        message: RelayMessage,
        reply: oneshot::Sender<()>,
    },
    AddObserver {
        scopes: Vec<ObserverScope>,
        callback: Observer,
        reply: oneshot::Sender<()>,
    },
    Join {
        topic: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Leave {
        topic: String,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    EmitGossip {
        topic: String,
        exclude: HashSet<PeerId>,
        reply: oneshot::Sender<()>,
    },
    MakePrune {
        peer: PeerId,
        topic: String,
        do_px: bool,
        reply: oneshot::Sender<ControlMessage>,
    },
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    FanoutPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ExpireFanout(oneshot::Sender<usize>),
    Stop,
}

/// Handle to a running relay engine. Clone freely; all clones talk to the
/// same actor.
#[derive(Clone)]
pub struct Relay {
    cmd_tx: mpsc::Sender<Command>,
}

impl Relay {
    /// Spawn the engine actor over a substrate.
    ///
    /// The engine starts in the CREATED state: call [`start`](Self::start)
    /// before sending, joining, or expecting observer dispatch.
    pub fn spawn<S: GossipSubstrate>(
        local: PeerId,
        substrate: Arc<S>,
        options: RelayOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = RelayActor::new(local, substrate, options);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RelayError::Stopped)?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    /// Subscribe to the configured pubsub topic and begin dispatching
    /// inbound messages to observers.
    pub async fn start(&self) -> Result<(), RelayError> {
        self.request(Command::Start).await?
    }

    /// Encode and publish an envelope on the configured pubsub topic.
    /// Best-effort: returns once the publish path has run, not once peers
    /// have received anything.
    pub async fn send(&self, envelope: MessageEnvelope) -> Result<(), RelayError> {
        self.request(|reply| Command::Publish {
            pubsub_topic: None,
            envelope,
            deliver_local: false,
            reply,
        })
        .await?
    }

    /// [`send`](Self::send) on an explicit pubsub topic.
    pub async fn send_on(
        &self,
        pubsub_topic: &str,
        envelope: MessageEnvelope,
    ) -> Result<(), RelayError> {
        self.request(|reply| Command::Publish {
            pubsub_topic: Some(pubsub_topic.to_string()),
            envelope,
            deliver_local: false,
            reply,
        })
        .await?
    }

    /// Publish on behalf of an external injector (light push): like
    /// [`send_on`](Self::send_on) but local observers also see the message,
    /// since the injecting node is itself a mesh member serving subscribers.
    pub async fn inject(
        &self,
        pubsub_topic: &str,
        envelope: MessageEnvelope,
    ) -> Result<(), RelayError> {
        self.request(|reply| Command::Publish {
            pubsub_topic: Some(pubsub_topic.to_string()),
            envelope,
            deliver_local: true,
            reply,
        })
        .await?
    }

    /// Register an observer. An empty `content_topics` list registers it
    /// for every message; otherwise it runs only for envelopes tagged with
    /// one of the given content topics.
    pub async fn add_observer<F>(
        &self,
        callback: F,
        content_topics: &[&str],
    ) -> Result<(), RelayError>
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        let scopes = if content_topics.is_empty() {
            vec![ObserverScope::Any]
        } else {
            content_topics
                .iter()
                .map(|t| ObserverScope::Topic(t.to_string()))
                .collect()
        };
        let callback: Observer = Arc::new(callback);
        self.request(|reply| Command::AddObserver {
            scopes,
            callback,
            reply,
        })
        .await
    }

    /// Join a topic's mesh, promoting any warm fanout set.
    pub async fn join(&self, topic: &str) -> Result<(), RelayError> {
        self.request(|reply| Command::Join {
            topic: topic.to_string(),
            reply,
        })
        .await?
    }

    /// Leave a topic's mesh, pruning every mesh link.
    pub async fn leave(&self, topic: &str) -> Result<(), RelayError> {
        self.request(|reply| Command::Leave {
            topic: topic.to_string(),
            reply,
        })
        .await?
    }

    /// Hand over a message delivered by the substrate. Runs observer
    /// dispatch (for remote messages on the pubsub topic) and the forward
    /// path. Malformed payloads are logged and dropped without affecting
    /// later messages.
    pub async fn process(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.request(|reply| Command::Process { message, reply }).await
    }

    /// Advertise recently seen message ids for a topic to a bounded random
    /// sample of eligible peers. Driven by the external heartbeat.
    pub async fn emit_gossip(
        &self,
        topic: &str,
        exclude: HashSet<PeerId>,
    ) -> Result<(), RelayError> {
        self.request(|reply| Command::EmitGossip {
            topic: topic.to_string(),
            exclude,
            reply,
        })
        .await
    }

    /// Build the PRUNE control message for a peer on a topic, with peer
    /// exchange when `do_px` is set.
    pub async fn make_prune(
        &self,
        peer: PeerId,
        topic: &str,
        do_px: bool,
    ) -> Result<ControlMessage, RelayError> {
        self.request(|reply| Command::MakePrune {
            peer,
            topic: topic.to_string(),
            do_px,
            reply,
        })
        .await
    }

    /// Current mesh membership for the pubsub topic, filtered to peers at
    /// or above the publish threshold.
    pub async fn peers(&self) -> Result<Vec<PeerId>, RelayError> {
        self.request(Command::GetPeers).await
    }

    /// Mesh membership for an arbitrary topic.
    pub async fn mesh_peers(&self, topic: &str) -> Result<Vec<PeerId>, RelayError> {
        self.request(|reply| Command::MeshPeers {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    /// Fanout membership for an arbitrary topic.
    pub async fn fanout_peers(&self, topic: &str) -> Result<Vec<PeerId>, RelayError> {
        self.request(|reply| Command::FanoutPeers {
            topic: topic.to_string(),
            reply,
        })
        .await
    }

    /// Evict fanout entries idle past the fanout TTL. Driven by the
    /// external heartbeat; returns how many topics were evicted.
    pub async fn expire_fanout(&self) -> Result<usize, RelayError> {
        self.request(Command::ExpireFanout).await
    }

    /// Stop the engine. Subsequent operations fail with
    /// [`RelayError::Stopped`].
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop).await;
    }
}

struct RelayActor<S> {
    local: PeerId,
    substrate: Arc<S>,
    options: RelayOptions,
    started: bool,
    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, HashSet<PeerId>>,
    last_publish: HashMap<String, Instant>,
    direct: HashSet<PeerId>,
    observers: ObserverRegistry,
}

impl<S: GossipSubstrate> RelayActor<S> {
    fn new(local: PeerId, substrate: Arc<S>, options: RelayOptions) -> Self {
        let direct = options.direct_peers.iter().copied().collect();
        Self {
            local,
            substrate,
            options,
            started: false,
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            last_publish: HashMap::new(),
            direct,
            observers: ObserverRegistry::default(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Start(reply) => {
                    let _ = reply.send(self.handle_start());
                }
                Command::Publish {
                    pubsub_topic,
                    envelope,
                    deliver_local,
                    reply,
                } => {
                    let _ = reply.send(self.handle_publish(pubsub_topic, envelope, deliver_local));
                }
                Command::Process { message, reply } => {
                    self.handle_process(message);
                    let _ = reply.send(());
                }
                Command::AddObserver {
                    scopes,
                    callback,
                    reply,
                } => {
                    for scope in scopes {
                        self.observers.register(scope, callback.clone());
                    }
                    let _ = reply.send(());
                }
                Command::Join { topic, reply } => {
                    let _ = reply.send(self.handle_join(&topic));
                }
                Command::Leave { topic, reply } => {
                    let _ = reply.send(self.handle_leave(&topic));
                }
                Command::EmitGossip {
                    topic,
                    exclude,
                    reply,
                } => {
                    self.handle_emit_gossip(&topic, &exclude);
                    let _ = reply.send(());
                }
                Command::MakePrune {
                    peer,
                    topic,
                    do_px,
                    reply,
                } => {
                    let _ = reply.send(self.build_prune(peer, &topic, do_px));
                }
                Command::GetPeers(reply) => {
                    let _ = reply.send(self.publishable_mesh_peers());
                }
                Command::MeshPeers { topic, reply } => {
                    let peers = self
                        .mesh
                        .get(&topic)
                        .map(|set| set.iter().copied().collect())
                        .unwrap_or_default();
                    let _ = reply.send(peers);
                }
                Command::FanoutPeers { topic, reply } => {
                    let peers = self
                        .fanout
                        .get(&topic)
                        .map(|set| set.iter().copied().collect())
                        .unwrap_or_default();
                    let _ = reply.send(peers);
                }
                Command::ExpireFanout(reply) => {
                    let _ = reply.send(self.handle_expire_fanout());
                }
                Command::Stop => {
                    debug!("relay actor stopping");
                    break;
                }
            }
        }
    }

    fn handle_start(&mut self) -> Result<(), RelayError> {
        if self.started {
            return Ok(());
        }
        self.substrate.subscribe(&self.options.pubsub_topic);
        self.started = true;
        debug!(topic = %self.options.pubsub_topic, "relay engine started");
        Ok(())
    }

    fn handle_publish(
        &mut self,
        pubsub_topic: Option<String>,
        envelope: MessageEnvelope,
        deliver_local: bool,
    ) -> Result<(), RelayError> {
        if !self.started {
            return Err(RelayError::NotStarted);
        }
        let topic = pubsub_topic.unwrap_or_else(|| self.options.pubsub_topic.clone());
        let message = RelayMessage::local(self.local, topic, envelope.encode());
        if deliver_local {
            self.dispatch(&message);
        }
        self.publish(message);
        Ok(())
    }

    fn handle_process(&mut self, message: RelayMessage) {
        if !self.started {
            trace!("dropping message delivered before start");
            return;
        }
        self.dispatch(&message);
        self.publish(message);
    }

    /// Deliver a message's envelope to matching observers. Failures are
    /// isolated per message: a frame that does not decode is logged and
    /// dropped, and never blocks later frames or the forward path.
    fn dispatch(&self, message: &RelayMessage) {
        if !message
            .topics
            .iter()
            .any(|t| t == &self.options.pubsub_topic)
        {
            return;
        }
        match MessageEnvelope::decode(&message.data) {
            Ok(envelope) => self.observers.dispatch(&envelope),
            Err(error) => {
                debug!(from = %message.received_from, %error, "dropping undecodable inbound message");
            }
        }
    }

    /// The publish path, run for every locally- or remotely-originated
    /// message: bookkeeping, caching, recipient-set computation, and
    /// fire-and-forget forwarding.
    fn publish(&mut self, message: RelayMessage) {
        if message.received_from != self.local {
            self.substrate.record_delivery(&message);
        }
        let id = self.substrate.message_id(&message);
        self.substrate.mark_seen(id);
        self.substrate.cache_message(id, &message);

        let mut to_send: HashSet<PeerId> = HashSet::new();
        for topic in &message.topics {
            if self.substrate.peers_in_topic(topic).is_empty() {
                continue;
            }
            to_send.extend(self.direct.iter().copied());

            let mesh_peers = self.mesh.get(topic).filter(|set| !set.is_empty());
            if let Some(mesh_peers) = mesh_peers {
                to_send.extend(mesh_peers.iter().copied());
            } else {
                // Not in the mesh for this topic: publish through fanout,
                // selecting and caching a fresh set if none is warm.
                let peers = match self.fanout.get(topic) {
                    Some(fanout_peers) => fanout_peers.clone(),
                    None => {
                        let threshold = self.options.thresholds.publish_threshold;
                        let substrate = self.substrate.as_ref();
                        let picked = select_relay_peers(substrate, topic, self.options.d, |p| {
                            substrate.score(p) >= threshold
                        });
                        if !picked.is_empty() {
                            trace!(topic = %topic, peers = picked.len(), "cached fanout set");
                            self.fanout.insert(topic.clone(), picked.clone());
                        }
                        picked
                    }
                };
                self.last_publish.insert(topic.clone(), Instant::now());
                to_send.extend(peers);
            }
        }

        let mut forwarded = 0usize;
        for peer in to_send {
            if peer == message.from {
                continue;
            }
            self.spawn_forward(peer, message.clone());
            forwarded += 1;
        }
        trace!(
            id = %hex::encode(&id[..8]),
            peers = forwarded,
            "published message"
        );
    }

    fn handle_join(&mut self, topic: &str) -> Result<(), RelayError> {
        if !self.started {
            return Err(RelayError::NotStarted);
        }

        let mesh_set = if let Some(mut peers) = self.fanout.remove(topic) {
            // Fanout peers cleared the publish threshold, which may be
            // negative; drop the ones with a negative score before
            // promoting the set to mesh.
            peers.retain(|p| self.substrate.score(p) >= 0.0);
            if peers.len() < self.options.d {
                let need = self.options.d - peers.len();
                let substrate = self.substrate.as_ref();
                let direct = &self.direct;
                let current = peers.clone();
                let backfill = select_relay_peers(substrate, topic, need, |p| {
                    !current.contains(p) && !direct.contains(p) && substrate.score(p) >= 0.0
                });
                peers.extend(backfill);
            }
            self.last_publish.remove(topic);
            peers
        } else {
            let substrate = self.substrate.as_ref();
            let direct = &self.direct;
            select_relay_peers(substrate, topic, self.options.d, |p| {
                !direct.contains(p) && substrate.score(p) >= 0.0
            })
        };

        for peer in &mesh_set {
            debug!(peer = %peer, topic = %topic, "join: adding mesh link");
            self.spawn_control(
                *peer,
                ControlMessage::Graft {
                    topic: topic.to_string(),
                },
            );
        }
        self.mesh.insert(topic.to_string(), mesh_set);
        Ok(())
    }

    fn handle_leave(&mut self, topic: &str) -> Result<(), RelayError> {
        if !self.started {
            return Err(RelayError::NotStarted);
        }
        if let Some(peers) = self.mesh.remove(topic) {
            for peer in peers {
                debug!(peer = %peer, topic = %topic, "leave: pruning mesh link");
                let prune = self.build_prune(peer, topic, self.options.do_px);
                self.spawn_control(peer, prune);
            }
        }
        Ok(())
    }

    /// Build a PRUNE for one peer. Backoff is converted from the
    /// millisecond constant to whole seconds for the wire.
    fn build_prune(&self, peer: PeerId, topic: &str, do_px: bool) -> ControlMessage {
        let backoff_secs = self.options.prune_backoff.as_millis() as u64 / 1000;
        let peers = if do_px {
            let substrate = self.substrate.as_ref();
            select_relay_peers(substrate, topic, self.options.prune_peers, |p| {
                *p != peer && substrate.score(p) >= 0.0
            })
            .into_iter()
            .map(|p| PeerExchangeInfo {
                peer: p,
                signed_record: substrate.signed_record(&p),
            })
            .collect()
        } else {
            Vec::new()
        };
        ControlMessage::Prune {
            topic: topic.to_string(),
            peers,
            backoff_secs,
        }
    }

    fn handle_emit_gossip(&mut self, topic: &str, exclude: &HashSet<PeerId>) {
        let mut message_ids = self.substrate.gossip_message_ids(topic);
        if message_ids.is_empty() {
            return;
        }
        let mut rng = rand::thread_rng();
        message_ids.shuffle(&mut rng);
        if message_ids.len() > self.options.max_ihave_length {
            debug!(
                topic = %topic,
                count = message_ids.len(),
                "too many ids for one advertisement; truncating per peer"
            );
        }

        let mut candidates: Vec<PeerId> = self
            .substrate
            .peers_in_topic(topic)
            .into_iter()
            .filter(|p| !exclude.contains(p) && !self.direct.contains(p))
            .filter(|p| self.substrate.peer_protocol(p).as_deref() == Some(RELAY_PROTOCOL_ID))
            .filter(|p| self.substrate.score(p) >= self.options.thresholds.gossip_threshold)
            .collect();
        if candidates.is_empty() {
            return;
        }

        let mut target = self.options.d_lazy;
        let factor = (self.options.gossip_factor * candidates.len() as f64) as usize;
        if factor > target {
            target = factor;
        }
        if target >= candidates.len() {
            target = candidates.len();
        } else {
            candidates.shuffle(&mut rng);
        }

        for peer in candidates.into_iter().take(target) {
            // Over-length id lists are shuffled and truncated
            // independently per peer.
            let peer_ids = if message_ids.len() > self.options.max_ihave_length {
                let mut ids = message_ids.clone();
                ids.shuffle(&mut rng);
                ids.truncate(self.options.max_ihave_length);
                ids
            } else {
                message_ids.clone()
            };
            self.spawn_control(
                peer,
                ControlMessage::IHave {
                    topic: topic.to_string(),
                    message_ids: peer_ids,
                },
            );
        }
    }

    fn publishable_mesh_peers(&self) -> Vec<PeerId> {
        let threshold = self.options.thresholds.publish_threshold;
        self.mesh
            .get(&self.options.pubsub_topic)
            .map(|set| {
                set.iter()
                    .filter(|p| self.substrate.score(p) >= threshold)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handle_expire_fanout(&mut self) -> usize {
        let ttl = self.options.fanout_ttl;
        let stale: Vec<String> = self
            .last_publish
            .iter()
            .filter(|(_, at)| at.elapsed() > ttl)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &stale {
            self.fanout.remove(topic);
            self.last_publish.remove(topic);
            debug!(topic = %topic, "expired idle fanout set");
        }
        stale.len()
    }

    fn spawn_forward(&self, to: PeerId, message: RelayMessage) {
        let substrate = Arc::clone(&self.substrate);
        tokio::spawn(async move {
            if let Err(error) = substrate.forward(to, message).await {
                debug!(peer = %to, %error, "message forward failed");
            }
        });
    }

    fn spawn_control(&self, to: PeerId, control: ControlMessage) {
        let substrate = Arc::clone(&self.substrate);
        tokio::spawn(async move {
            if let Err(error) = substrate.send_control(to, control).await {
                debug!(peer = %to, %error, "control send failed");
            }
        });
    }
}
