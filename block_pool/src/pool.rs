use core::time::Duration;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use futures::{
    channel::{mpsc::Sender, oneshot},
    select, FutureExt as _, StreamExt as _,
};
use logging::{debug_with_peers, info_with_peers, warn_with_peers, SYNC_LOG_METRICS};
use parking_lot::Mutex;
use prometheus_metrics::Metrics;
use tokio::{runtime::Handle, time::Instant};
use tokio_stream::wrappers::IntervalStream;

use crate::{
    config::PoolConfig,
    error::Error,
    messages::{BlockRequest, Channels, PeerTimeout},
    misc::{Block, Height, PeerId},
    peers::PeerRegistry,
    requests::RequestLedger,
};

const NOT_ENOUGH_PEERS_MESSAGE_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct PoolStatus {
    pub height: Height,
    pub pending_requests: usize,
    pub buffered_blocks: usize,
    pub peer_count: usize,
    pub max_peer_height: Option<Height>,
}

/// Schedules block downloads from untrusted peers and hands blocks out in height order.
///
/// The pool is a cheap handle. Clones share the same state.
pub struct BlockPool<B> {
    state: Arc<Mutex<PoolState<B>>>,
}

impl<B> Clone for BlockPool<B> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<B: Block> BlockPool<B> {
    pub fn new(
        config: PoolConfig,
        start_height: Height,
        channels: Channels,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let Channels {
            block_requests_tx,
            peer_timeouts_tx,
        } = channels;

        SYNC_LOG_METRICS.set_height(start_height);

        let state = PoolState {
            config,
            lifecycle: Lifecycle::Idle,
            height: start_height,
            peers: PeerRegistry::default(),
            requests: RequestLedger::default(),
            blocks: BTreeMap::new(),
            retry_exclusions: HashMap::new(),
            not_enough_peers_message_shown_at: None,
            block_requests_tx,
            peer_timeouts_tx,
            metrics,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Spawns the scheduler on the current Tokio runtime.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock();

        match state.lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(Error::AlreadyStarted),
            Lifecycle::Stopped => return Err(Error::AlreadyStopped),
        }

        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let tick_interval = state.config.tick_interval;

        runtime.spawn(run_scheduler(Arc::clone(&self.state), tick_interval, stop_rx));

        state.lifecycle = Lifecycle::Running(stop_tx);

        info_with_peers!("block pool started (height: {})", state.height);

        Ok(())
    }

    /// Stops the scheduler for good. No requests are issued after this returns.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock();

        match core::mem::replace(&mut state.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle => {}
            Lifecycle::Running(stop_tx) => {
                // The scheduler also exits when the sender is dropped.
                let _ = stop_tx.send(());
            }
            Lifecycle::Stopped => return Err(Error::AlreadyStopped),
        }

        info_with_peers!("block pool stopped (height: {})", state.height);

        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state.lock().lifecycle, Lifecycle::Running(_))
    }

    /// Runs one scheduling step immediately, independently of the scheduler task.
    pub fn tick(&self) -> Result<(), Error> {
        let mut state = self.state.lock();

        if matches!(state.lifecycle, Lifecycle::Stopped) {
            return Err(Error::AlreadyStopped);
        }

        state.on_tick(Instant::now());

        Ok(())
    }

    pub fn set_peer_height(&self, peer_id: PeerId, height: Height) {
        self.state.lock().set_peer_height(peer_id, height)
    }

    /// Returns `false` if the peer was not known.
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        self.state.lock().remove_peer(peer_id)
    }

    #[must_use]
    pub fn best_peer_for(&self, height: Height) -> Option<PeerId> {
        let state = self.state.lock();

        state
            .peers
            .best_peer_for(height, state.config.max_requests_per_peer)
    }

    /// Returns `true` if the block answered an outstanding request and was buffered.
    ///
    /// Anything else (unsolicited blocks, duplicates, blocks from the wrong peer, late responses to
    /// expired requests) is dropped without touching the pool or penalizing the sender.
    pub fn add_block(&self, block: Arc<B>, peer_id: PeerId) -> bool {
        self.state.lock().add_block(block, peer_id, Instant::now())
    }

    /// Returns the blocks at the current height and the one after it if both have arrived.
    #[must_use]
    pub fn peek_two_blocks(&self) -> Option<(Arc<B>, Arc<B>)> {
        self.state.lock().peek_two_blocks()
    }

    /// Removes the block at the current height and advances to the next one.
    pub fn pop_request(&self) -> Result<Arc<B>, Error> {
        self.state.lock().pop_request()
    }

    /// Discards the buffered block at `height` after the consumer rejected it.
    ///
    /// The peer that delivered it is removed along with every other block it delivered, and the
    /// heights become eligible for new requests. Returns the removed peer.
    pub fn redo_request(&self, height: Height) -> Result<PeerId, Error> {
        self.state.lock().redo_request(height)
    }

    #[must_use]
    pub fn height(&self) -> Height {
        self.state.lock().height
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.state.lock().status()
    }

    #[must_use]
    pub fn is_caught_up(&self) -> bool {
        let state = self.state.lock();

        if state.peers.len() < state.config.min_peers_to_be_caught_up {
            return false;
        }

        state
            .peers
            .max_peer_height()
            .is_some_and(|max_peer_height| state.height >= max_peer_height)
    }
}

async fn run_scheduler<B: Block>(
    state: Arc<Mutex<PoolState<B>>>,
    tick_interval: Duration,
    stop_rx: oneshot::Receiver<()>,
) {
    let mut interval = IntervalStream::new(tokio::time::interval(tick_interval)).fuse();
    let mut stop_rx = stop_rx.fuse();

    loop {
        select! {
            _ = interval.select_next_some() => {
                let mut state = state.lock();

                if !matches!(state.lifecycle, Lifecycle::Running(_)) {
                    break;
                }

                state.on_tick(Instant::now());
            },

            _ = stop_rx => break,
        }
    }

    debug_with_peers!("block pool scheduler exited");
}

enum Lifecycle {
    Idle,
    Running(oneshot::Sender<()>),
    Stopped,
}

struct BufferedBlock<B> {
    block: Arc<B>,
    peer_id: PeerId,
}

struct PoolState<B> {
    config: PoolConfig,
    lifecycle: Lifecycle,
    // Lowest height not yet popped by the consumer.
    height: Height,
    peers: PeerRegistry,
    requests: RequestLedger,
    blocks: BTreeMap<Height, BufferedBlock<B>>,
    // Peers that most recently failed to deliver a height. Avoided when re-requesting it.
    retry_exclusions: HashMap<Height, PeerId>,
    not_enough_peers_message_shown_at: Option<Instant>,
    block_requests_tx: Sender<BlockRequest>,
    peer_timeouts_tx: Sender<PeerTimeout>,
    metrics: Option<Arc<Metrics>>,
}

impl<B: Block> PoolState<B> {
    fn on_tick(&mut self, now: Instant) {
        self.sweep_timeouts(now);
        self.fill_window(now);
        self.track_metrics();
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let expired = self
            .requests
            .sweep_timeouts(now, self.config.request_timeout);

        for (height, peer_id) in expired {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.block_pool_request_timeouts.inc();
            }

            PeerTimeout {
                height,
                peer_id: peer_id.clone(),
            }
            .send(&mut self.peer_timeouts_tx);

            self.retry_exclusions.insert(height, peer_id.clone());

            // The peer may have been evicted by an earlier timeout in this sweep.
            let Some(consecutive_timeouts) = self.peers.record_timeout(&peer_id) else {
                continue;
            };

            warn_with_peers!(
                "block request timed out (height: {height}, peer_id: {peer_id}, \
                 consecutive timeouts: {consecutive_timeouts})",
            );

            if consecutive_timeouts > self.config.max_consecutive_timeouts {
                info_with_peers!(
                    "evicting peer {peer_id} after {consecutive_timeouts} consecutive timeouts",
                );

                self.evict_peer(&peer_id);
            }
        }
    }

    fn fill_window(&mut self, now: Instant) {
        let Some(max_peer_height) = self.peers.max_peer_height() else {
            self.warn_not_enough_peers(self.height);
            return;
        };

        let max_pending_requests = self.config.max_pending_requests.get();

        let window_end = self
            .height
            .saturating_add(self.config.max_pending_heights())
            .min(max_peer_height.saturating_add(1));

        let mut next_height = self.height;

        while self.requests.len() + self.blocks.len() < max_pending_requests {
            let Some(height) = (next_height..window_end)
                .find(|height| !self.requests.contains(*height) && !self.blocks.contains_key(height))
            else {
                break;
            };

            let Some(peer_id) = self.peers.best_peer_excluding(
                height,
                self.config.max_requests_per_peer,
                self.retry_exclusions.get(&height),
            ) else {
                if self.peers.can_serve(height) {
                    debug_with_peers!(
                        "all peers that can serve block at height {height} \
                         are at their request limit",
                    );
                } else {
                    self.warn_not_enough_peers(height);
                }

                break;
            };

            if let Err(error) = self.requests.create(height, peer_id.clone(), now) {
                warn_with_peers!("unable to create block request: {error}");
                break;
            }

            self.peers.record_request(&peer_id);

            let request = BlockRequest {
                height,
                peer_id: peer_id.clone(),
            };

            if !request.send(&mut self.block_requests_tx) {
                self.requests.release(height);
                self.peers.record_release(&peer_id);
                break;
            }

            features::log!(
                DebugBlockPool,
                "requested block (height: {height}, peer_id: {peer_id})",
            );

            if let Some(metrics) = self.metrics.as_ref() {
                metrics.block_pool_issued_requests.inc();
            }

            next_height = height + 1;
        }
    }

    fn set_peer_height(&mut self, peer_id: PeerId, height: Height) {
        if height < self.height {
            if self.peers.contains(&peer_id) {
                debug_with_peers!(
                    "removing peer {peer_id} because its height {height} is below pool height {}",
                    self.height,
                );

                self.remove_peer(&peer_id);
            }

            return;
        }

        let previous_height = self.peers.set_peer_height(peer_id.clone(), height);

        match previous_height {
            None => debug_with_peers!("add peer (peer_id: {peer_id}, height: {height})"),
            Some(previous_height) if height < previous_height => {
                for released_height in self.requests.release_above(&peer_id, height) {
                    self.peers.record_release(&peer_id);

                    debug_with_peers!(
                        "released request for height {released_height} because peer {peer_id} \
                         lowered its height from {previous_height} to {height}",
                    );
                }
            }
            Some(_) => {}
        }

        SYNC_LOG_METRICS.set_peer_count(self.peers.len());
    }

    fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        if self.peers.remove_peer(peer_id).is_none() {
            return false;
        }

        let released_heights = self.requests.remove_peer(peer_id);

        debug_with_peers!(
            "remove peer (peer_id: {peer_id}, released requests: {})",
            released_heights.len(),
        );

        SYNC_LOG_METRICS.set_peer_count(self.peers.len());

        true
    }

    fn evict_peer(&mut self, peer_id: &PeerId) {
        if self.remove_peer(peer_id) {
            if let Some(metrics) = self.metrics.as_ref() {
                metrics.block_pool_evicted_peers.inc();
            }
        }
    }

    fn add_block(&mut self, block: Arc<B>, peer_id: PeerId, now: Instant) -> bool {
        let height = block.height();

        let Some(request) = self.requests.resolve_on_delivery(height, &peer_id) else {
            features::log!(
                DebugBlockPool,
                "ignoring unsolicited block (height: {height}, peer_id: {peer_id}, \
                 assigned peer: {:?})",
                self.requests.peer_for(height),
            );

            if let Some(metrics) = self.metrics.as_ref() {
                metrics.block_pool_stale_deliveries.inc();
            }

            return false;
        };

        self.peers.record_delivery(&peer_id);
        self.retry_exclusions.remove(&height);

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.observe_request_round_trip_time(now.saturating_duration_since(request.issued_at));
        }

        features::log!(
            DebugBlockPool,
            "accepted block (height: {height}, peer_id: {peer_id})",
        );

        self.blocks.insert(height, BufferedBlock { block, peer_id });

        true
    }

    fn peek_two_blocks(&self) -> Option<(Arc<B>, Arc<B>)> {
        let first = self.blocks.get(&self.height)?;
        let second = self.blocks.get(&(self.height + 1))?;

        Some((Arc::clone(&first.block), Arc::clone(&second.block)))
    }

    fn pop_request(&mut self) -> Result<Arc<B>, Error> {
        let height = self.height;

        let BufferedBlock { block, .. } = self
            .blocks
            .remove(&height)
            .ok_or(Error::NotReady { height })?;

        self.height += 1;
        self.retry_exclusions.remove(&height);

        SYNC_LOG_METRICS.set_height(self.height);

        if let Some(metrics) = self.metrics.as_ref() {
            metrics.block_pool_popped_blocks.inc();
        }

        Ok(block)
    }

    fn redo_request(&mut self, height: Height) -> Result<PeerId, Error> {
        let BufferedBlock { peer_id, .. } = self
            .blocks
            .remove(&height)
            .ok_or(Error::NoBufferedBlock { height })?;

        warn_with_peers!("redoing request for height {height}, removing peer {peer_id}");

        self.blocks
            .retain(|_, buffered_block| buffered_block.peer_id != peer_id);

        self.retry_exclusions.insert(height, peer_id.clone());
        self.evict_peer(&peer_id);

        Ok(peer_id)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            height: self.height,
            pending_requests: self.requests.len(),
            buffered_blocks: self.blocks.len(),
            peer_count: self.peers.len(),
            max_peer_height: self.peers.max_peer_height(),
        }
    }

    fn warn_not_enough_peers(&mut self, height: Height) {
        if self
            .not_enough_peers_message_shown_at
            .map(|instant| instant.elapsed() > NOT_ENOUGH_PEERS_MESSAGE_COOLDOWN)
            .unwrap_or(true)
        {
            warn_with_peers!("no available peer can serve block at height {height}");
            self.not_enough_peers_message_shown_at = Some(Instant::now());
        }
    }

    fn track_metrics(&self) {
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.set_block_pool_state(
                self.peers.len(),
                self.requests.len(),
                self.blocks.len(),
                self.height,
            );
        }
    }
}
