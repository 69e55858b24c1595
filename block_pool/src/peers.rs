use core::{cmp::Ordering, num::NonZeroUsize};
use std::collections::HashMap;

use crate::misc::{Height, PeerId};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Peer {
    pub height: Height,
    pub pending_requests: usize,
    pub consecutive_timeouts: usize,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    /// Returns the previously advertised height if the peer was already known.
    pub fn set_peer_height(&mut self, peer_id: PeerId, height: Height) -> Option<Height> {
        match self.peers.get_mut(&peer_id) {
            Some(peer) => Some(core::mem::replace(&mut peer.height, height)),
            None => {
                self.peers.insert(
                    peer_id,
                    Peer {
                        height,
                        ..Peer::default()
                    },
                );

                None
            }
        }
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.remove(peer_id)
    }

    #[cfg(test)]
    fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn max_peer_height(&self) -> Option<Height> {
        self.peers.values().map(|peer| peer.height).max()
    }

    /// Whether any peer has reached `height`, regardless of how busy it is.
    pub fn can_serve(&self, height: Height) -> bool {
        self.peers.values().any(|peer| peer.height >= height)
    }

    pub fn best_peer_for(
        &self,
        height: Height,
        max_requests_per_peer: NonZeroUsize,
    ) -> Option<PeerId> {
        self.best_peer_excluding(height, max_requests_per_peer, None)
    }

    /// Like [`Self::best_peer_for`], but avoids `excluded` unless it is the only candidate.
    pub fn best_peer_excluding(
        &self,
        height: Height,
        max_requests_per_peer: NonZeroUsize,
        excluded: Option<&PeerId>,
    ) -> Option<PeerId> {
        let candidates = || {
            self.peers.iter().filter(move |(_, peer)| {
                peer.height >= height && peer.pending_requests < max_requests_per_peer.get()
            })
        };

        candidates()
            .filter(|(peer_id, _)| Some(*peer_id) != excluded)
            .max_by(preference)
            .or_else(|| candidates().max_by(preference))
            .map(|(peer_id, _)| peer_id.clone())
    }

    pub fn record_request(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.pending_requests += 1;
        }
    }

    pub fn record_delivery(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.pending_requests = peer.pending_requests.saturating_sub(1);
            peer.consecutive_timeouts = 0;
        }
    }

    /// Undoes [`Self::record_request`] for a request withdrawn without the peer being at fault.
    pub fn record_release(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.pending_requests = peer.pending_requests.saturating_sub(1);
        }
    }

    /// Returns the updated number of consecutive timeouts, or `None` if the peer is unknown.
    pub fn record_timeout(&mut self, peer_id: &PeerId) -> Option<usize> {
        let peer = self.peers.get_mut(peer_id)?;
        peer.pending_requests = peer.pending_requests.saturating_sub(1);
        peer.consecutive_timeouts += 1;
        Some(peer.consecutive_timeouts)
    }
}

// Taller chains first, then less busy peers. Peer IDs make the order total.
fn preference((a_id, a): &(&PeerId, &Peer), (b_id, b): &(&PeerId, &Peer)) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| b.pending_requests.cmp(&a.pending_requests))
        .then_with(|| b_id.cmp(a_id))
}

#[cfg(test)]
mod tests {
    use nonzero_ext::nonzero;
    use test_case::test_case;

    use super::*;

    const MAX_REQUESTS_PER_PEER: NonZeroUsize = nonzero!(2_usize);

    fn build_registry(
        peers: impl IntoIterator<Item = (&'static str, Height, usize)>,
    ) -> PeerRegistry {
        let mut registry = PeerRegistry::default();

        for (peer_id, height, pending_requests) in peers {
            let peer_id = PeerId::from(peer_id);

            registry.set_peer_height(peer_id.clone(), height);

            for _ in 0..pending_requests {
                registry.record_request(&peer_id);
            }
        }

        registry
    }

    #[test_case(&[], 10 => None; "no peers")]
    #[test_case(&[("a", 5, 0)], 10 => None; "peer too short")]
    #[test_case(&[("a", 10, 0)], 10 => Some("a"); "exact height")]
    #[test_case(&[("a", 20, 0), ("b", 30, 0)], 10 => Some("b"); "tallest wins")]
    #[test_case(&[("a", 30, 1), ("b", 30, 0)], 10 => Some("b"); "least busy wins ties")]
    #[test_case(&[("b", 30, 0), ("a", 30, 0)], 10 => Some("a"); "peer id breaks remaining ties")]
    #[test_case(&[("a", 30, 2), ("b", 20, 1)], 10 => Some("b"); "busy peers are skipped")]
    #[test_case(&[("a", 30, 2), ("b", 20, 2)], 10 => None; "all peers busy")]
    fn best_peer_for(
        peers: &[(&'static str, Height, usize)],
        height: Height,
    ) -> Option<&'static str> {
        let registry = build_registry(peers.iter().copied());

        registry
            .best_peer_for(height, MAX_REQUESTS_PER_PEER)
            .map(|peer_id| match peer_id.as_str() {
                "a" => "a",
                "b" => "b",
                other => unreachable!("unexpected peer {other}"),
            })
    }

    #[test]
    fn excluded_peer_is_used_only_as_last_resort() {
        let registry = build_registry([("a", 30, 0), ("b", 20, 0)]);
        let excluded = PeerId::from("a");

        assert_eq!(
            registry.best_peer_excluding(10, MAX_REQUESTS_PER_PEER, Some(&excluded)),
            Some(PeerId::from("b")),
        );

        let registry = build_registry([("a", 30, 0), ("b", 5, 0)]);

        assert_eq!(
            registry.best_peer_excluding(10, MAX_REQUESTS_PER_PEER, Some(&excluded)),
            Some(excluded),
        );
    }

    #[test]
    fn busy_peers_can_still_serve() {
        let registry = build_registry([("a", 30, 2)]);

        assert_eq!(registry.best_peer_for(10, MAX_REQUESTS_PER_PEER), None);
        assert!(registry.can_serve(30));
        assert!(!registry.can_serve(31));
    }

    #[test]
    fn lower_announcement_overwrites_height() {
        let mut registry = PeerRegistry::default();
        let peer_id = PeerId::from("a");

        assert_eq!(registry.set_peer_height(peer_id.clone(), 100), None);
        assert_eq!(registry.set_peer_height(peer_id.clone(), 50), Some(100));
        assert_eq!(registry.max_peer_height(), Some(50));
    }

    #[test]
    fn delivery_resets_consecutive_timeouts() {
        let mut registry = build_registry([("a", 30, 3)]);
        let peer_id = PeerId::from("a");

        assert_eq!(registry.record_timeout(&peer_id), Some(1));
        assert_eq!(registry.record_timeout(&peer_id), Some(2));

        registry.record_delivery(&peer_id);

        assert_eq!(
            registry.get(&peer_id),
            Some(&Peer {
                height: 30,
                pending_requests: 0,
                consecutive_timeouts: 0,
            }),
        );
    }

    #[test]
    fn removed_peer_does_not_record_timeouts() {
        let mut registry = build_registry([("a", 30, 1)]);
        let peer_id = PeerId::from("a");

        assert!(registry.remove_peer(&peer_id).is_some());
        assert_eq!(registry.record_timeout(&peer_id), None);
        assert!(registry.is_empty());
    }
}
