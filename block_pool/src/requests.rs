use core::time::Duration;
use std::collections::{btree_map::Entry, BTreeMap};

use itertools::Itertools as _;
use tokio::time::Instant;

use crate::{
    error::Error,
    misc::{Height, PeerId},
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PendingRequest {
    pub peer_id: PeerId,
    pub issued_at: Instant,
}

/// Outstanding block requests keyed by height. There is at most one request per height.
#[derive(Default)]
pub struct RequestLedger {
    requests: BTreeMap<Height, PendingRequest>,
}

impl RequestLedger {
    pub fn create(&mut self, height: Height, peer_id: PeerId, now: Instant) -> Result<(), Error> {
        match self.requests.entry(height) {
            Entry::Occupied(_) => Err(Error::DuplicateRequest { height }),
            Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    peer_id,
                    issued_at: now,
                });

                Ok(())
            }
        }
    }

    /// Removes and returns the request for `height` if it was assigned to `peer_id`.
    ///
    /// Returns `None` for unsolicited blocks, blocks from the wrong peer and late responses to
    /// requests that have already expired. The ledger is left untouched in those cases.
    pub fn resolve_on_delivery(
        &mut self,
        height: Height,
        peer_id: &PeerId,
    ) -> Option<PendingRequest> {
        match self.requests.entry(height) {
            Entry::Occupied(entry) if entry.get().peer_id == *peer_id => Some(entry.remove()),
            _ => None,
        }
    }

    pub fn sweep_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<(Height, PeerId)> {
        let expired_heights = self
            .requests
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.issued_at) > timeout)
            .map(|(height, _)| *height)
            .collect_vec();

        expired_heights
            .into_iter()
            .filter_map(|height| {
                self.requests
                    .remove(&height)
                    .map(|request| (height, request.peer_id))
            })
            .collect()
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Vec<Height> {
        self.release_where(|_, request| request.peer_id == *peer_id)
    }

    /// Releases requests assigned to `peer_id` for heights it no longer claims to have.
    pub fn release_above(&mut self, peer_id: &PeerId, peer_height: Height) -> Vec<Height> {
        self.release_where(|height, request| request.peer_id == *peer_id && height > peer_height)
    }

    pub fn release(&mut self, height: Height) -> Option<PendingRequest> {
        self.requests.remove(&height)
    }

    pub fn contains(&self, height: Height) -> bool {
        self.requests.contains_key(&height)
    }

    pub fn peer_for(&self, height: Height) -> Option<&PeerId> {
        self.requests.get(&height).map(|request| &request.peer_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    #[cfg(test)]
    fn heights(&self) -> impl Iterator<Item = Height> + '_ {
        self.requests.keys().copied()
    }

    fn release_where(
        &mut self,
        mut predicate: impl FnMut(Height, &PendingRequest) -> bool,
    ) -> Vec<Height> {
        let heights = self
            .requests
            .iter()
            .filter(|(height, request)| predicate(**height, *request))
            .map(|(height, _)| *height)
            .collect_vec();

        for height in &heights {
            self.requests.remove(height);
        }

        heights
    }
}
