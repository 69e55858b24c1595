use core::{ops::RangeInclusive, time::Duration};
use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use block_pool::{
    Block, BlockPool, BlockRequest, Channels, Height, PeerId, PeerTimeout, PoolConfig, PoolStatus,
    Receivers,
};
use futures::{channel::mpsc::Receiver, StreamExt as _};
use logging::{info_with_peers, warn_with_peers};
use prometheus::Registry;
use prometheus_metrics::Metrics;
use rand::Rng as _;
use tokio::time::Instant;

use crate::fast_sync_config::SimulationConfig;

const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROGRESS_LOG_INTERVAL: Height = 500;

/// A block whose commit can be checked against the block after it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SimulatedBlock {
    height: Height,
    authentic: bool,
}

impl Block for SimulatedBlock {
    fn height(&self) -> Height {
        self.height
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PeerBehavior {
    Honest,
    Silent,
    Faulty,
}

#[derive(Debug)]
pub struct SyncReport {
    pub status: PoolStatus,
    pub caught_up: bool,
    pub redone_requests: usize,
    pub request_timeouts: u64,
    pub elapsed: Duration,
}

pub async fn run(
    pool_config: PoolConfig,
    simulation_config: SimulationConfig,
    registry: &Registry,
) -> Result<SyncReport> {
    let SimulationConfig {
        peer_count,
        silent_peer_count,
        faulty_peer_count,
        start_height,
        target_height,
        latency,
    } = simulation_config;

    let metrics = Arc::new(Metrics::new()?);
    metrics.register(registry)?;

    let (channels, receivers) = Channels::bounded(pool_config.max_pending_requests.get());

    let Receivers {
        block_requests_rx,
        peer_timeouts_rx,
    } = receivers;

    let pool = BlockPool::new(
        pool_config,
        start_height,
        channels,
        Some(Arc::clone(&metrics)),
    )?;

    let behaviors = (0..peer_count)
        .map(|index| {
            let behavior = if index < silent_peer_count {
                PeerBehavior::Silent
            } else if index < silent_peer_count + faulty_peer_count {
                PeerBehavior::Faulty
            } else {
                PeerBehavior::Honest
            };

            (PeerId::from(format!("peer-{index}")), behavior)
        })
        .collect::<HashMap<_, _>>();

    for peer_id in behaviors.keys() {
        pool.set_peer_height(peer_id.clone(), target_height);
    }

    info_with_peers!(
        "starting fast sync from height {start_height} to {target_height} \
         (peers: {peer_count}, silent: {silent_peer_count}, faulty: {faulty_peer_count})",
    );

    let started_at = Instant::now();

    pool.start()?;

    let transport = tokio::spawn(serve_block_requests(
        pool.clone(),
        behaviors,
        latency,
        block_requests_rx,
    ));

    let timeout_monitor = tokio::spawn(log_peer_timeouts(peer_timeouts_rx));

    let redone_requests = consume_blocks(&pool, target_height).await?;

    pool.stop()?;
    transport.abort();
    timeout_monitor.abort();

    Ok(SyncReport {
        status: pool.status(),
        caught_up: pool.is_caught_up(),
        redone_requests,
        request_timeouts: metrics.block_pool_request_timeouts.get(),
        elapsed: started_at.elapsed(),
    })
}

/// Pops blocks until the pool reaches `target_height`. Returns the number of rejected blocks.
async fn consume_blocks(pool: &BlockPool<SimulatedBlock>, target_height: Height) -> Result<usize> {
    let mut redone_requests = 0;

    while pool.height() < target_height {
        let Some((first, second)) = pool.peek_two_blocks() else {
            tokio::time::sleep(CONSUMER_POLL_INTERVAL).await;
            continue;
        };

        if let Some(height) = first_inauthentic_height(&first, &second) {
            let peer_id = pool.redo_request(height)?;
            redone_requests += 1;

            warn_with_peers!("block {height} from peer {peer_id} failed verification");

            continue;
        }

        pool.pop_request()?;

        features::log!(LogPoolStatus, "{:?}", pool.status());

        let height = pool.height();

        if height % PROGRESS_LOG_INTERVAL == 0 {
            info_with_peers!("synced up to height {height}");
        }
    }

    Ok(redone_requests)
}

// The commit in `second` vouches for `first`, so a bad `second` invalidates the pair.
fn first_inauthentic_height(first: &SimulatedBlock, second: &SimulatedBlock) -> Option<Height> {
    [first, second]
        .into_iter()
        .find(|block| !block.authentic)
        .map(SimulatedBlock::height)
}

async fn serve_block_requests(
    pool: BlockPool<SimulatedBlock>,
    behaviors: HashMap<PeerId, PeerBehavior>,
    latency: RangeInclusive<Duration>,
    mut block_requests_rx: Receiver<BlockRequest>,
) {
    while let Some(BlockRequest { height, peer_id }) = block_requests_rx.next().await {
        let behavior = behaviors
            .get(&peer_id)
            .copied()
            .unwrap_or(PeerBehavior::Silent);

        if behavior == PeerBehavior::Silent {
            features::log!(
                DebugSimulatedTransport,
                "peer {peer_id} ignores request for block {height}",
            );

            continue;
        }

        let delay = rand::thread_rng().gen_range(latency.clone());
        let pool = pool.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let block = SimulatedBlock {
                height,
                authentic: behavior == PeerBehavior::Honest,
            };

            let accepted = pool.add_block(Arc::new(block), peer_id.clone());

            features::log!(
                DebugSimulatedTransport,
                "peer {peer_id} served block {height} after {delay:?} (accepted: {accepted})",
            );
        });
    }
}

async fn log_peer_timeouts(mut peer_timeouts_rx: Receiver<PeerTimeout>) {
    while let Some(PeerTimeout { height, peer_id }) = peer_timeouts_rx.next().await {
        features::log!(
            DebugSimulatedTransport,
            "peer {peer_id} did not serve block {height} in time",
        );
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn simulation_config(silent_peer_count: usize, faulty_peer_count: usize) -> SimulationConfig {
        SimulationConfig {
            peer_count: 6,
            silent_peer_count,
            faulty_peer_count,
            start_height: 1,
            target_height: 400,
            latency: Duration::from_millis(10)..=Duration::from_millis(100),
        }
    }

    #[test_case(true, true => None)]
    #[test_case(false, true => Some(1))]
    #[test_case(true, false => Some(2))]
    #[test_case(false, false => Some(1))]
    fn verification_reports_lowest_bad_block(first: bool, second: bool) -> Option<Height> {
        first_inauthentic_height(
            &SimulatedBlock {
                height: 1,
                authentic: first,
            },
            &SimulatedBlock {
                height: 2,
                authentic: second,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn honest_peers_reach_target_height() -> Result<()> {
        let report = run(
            PoolConfig::default(),
            simulation_config(0, 0),
            &Registry::new(),
        )
        .await?;

        assert_eq!(report.status.height, 400);
        assert_eq!(report.redone_requests, 0);
        assert_eq!(report.request_timeouts, 0);
        assert_eq!(report.status.peer_count, 6);
        assert!(report.caught_up);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn misbehaving_peers_are_routed_around() -> Result<()> {
        let report = run(
            PoolConfig::default(),
            simulation_config(2, 1),
            &Registry::new(),
        )
        .await?;

        assert_eq!(report.status.height, 400);
        assert!(report.redone_requests > 0);
        assert!(report.request_timeouts > 0);
        assert_eq!(report.status.peer_count, 3);
        assert!(report.caught_up);

        Ok(())
    }
}
