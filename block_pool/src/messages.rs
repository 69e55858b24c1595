use futures::channel::mpsc::{Receiver, Sender};
use logging::debug_with_peers;

use crate::misc::{Height, PeerId};

/// Asks the transport layer to fetch the block at `height` from `peer_id`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BlockRequest {
    pub height: Height,
    pub peer_id: PeerId,
}

impl BlockRequest {
    /// Returns `false` if the request could not be queued.
    /// The pool withdraws such requests and issues them again on a later tick.
    pub(crate) fn send(self, tx: &mut Sender<Self>) -> bool {
        match tx.try_send(self) {
            Ok(()) => true,
            Err(error) if error.is_full() => {
                debug_with_peers!(
                    "block request channel is full, deferring request (height: {})",
                    error.into_inner().height,
                );

                false
            }
            Err(_) => {
                debug_with_peers!("send to transport failed because the receiver was dropped");
                false
            }
        }
    }
}

/// Informational notice that `peer_id` failed to deliver the block at `height` in time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PeerTimeout {
    pub height: Height,
    pub peer_id: PeerId,
}

impl PeerTimeout {
    pub(crate) fn send(self, tx: &mut Sender<Self>) {
        if let Err(error) = tx.try_send(self) {
            let PeerTimeout { height, peer_id } = error.into_inner();

            debug_with_peers!(
                "dropping peer timeout notification (height: {height}, peer_id: {peer_id}) \
                 because the receiver is full or was dropped",
            );
        }
    }
}

pub struct Channels {
    pub block_requests_tx: Sender<BlockRequest>,
    pub peer_timeouts_tx: Sender<PeerTimeout>,
}

pub struct Receivers {
    pub block_requests_rx: Receiver<BlockRequest>,
    pub peer_timeouts_rx: Receiver<PeerTimeout>,
}

impl Channels {
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receivers) {
        let (block_requests_tx, block_requests_rx) = futures::channel::mpsc::channel(capacity);
        let (peer_timeouts_tx, peer_timeouts_rx) = futures::channel::mpsc::channel(capacity);

        let channels = Self {
            block_requests_tx,
            peer_timeouts_tx,
        };

        let receivers = Receivers {
            block_requests_rx,
            peer_timeouts_rx,
        };

        (channels, receivers)
    }
}
