//! Bounded random peer selection for mesh joins, fanout, and peer exchange.

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::peer::PeerId;
use crate::substrate::{GossipSubstrate, RELAY_PROTOCOL_ID};

/// Select up to `n` peers subscribed to `topic` that negotiated the relay
/// protocol and satisfy `predicate`.
///
/// Selection is uniformly random among eligible peers: callers must not
/// rely on which peers come back when more than `n` are eligible.
pub fn select_relay_peers<S>(
    substrate: &S,
    topic: &str,
    n: usize,
    mut predicate: impl FnMut(&PeerId) -> bool,
) -> HashSet<PeerId>
where
    S: GossipSubstrate + ?Sized,
{
    let mut candidates: Vec<PeerId> = substrate
        .peers_in_topic(topic)
        .into_iter()
        .filter(|peer| substrate.peer_protocol(peer).as_deref() == Some(RELAY_PROTOCOL_ID))
        .filter(|peer| predicate(peer))
        .collect();

    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(n);
    candidates.into_iter().collect()
}
