#![expect(
    unused_crate_dependencies,
    reason = "The `unused_crate_dependencies` lint checks every crate in a package separately. \
              See <https://github.com/rust-lang/rust/issues/57274>."
)]

use core::time::Duration;
use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use block_pool::{
    Block, BlockPool, BlockRequest, Channels, Height, PeerId, PeerTimeout, PoolConfig, Receivers,
};
use futures::{channel::mpsc::Receiver, StreamExt as _};
use nonzero_ext::nonzero;

const START_HEIGHT: Height = 42;
const TARGET_HEIGHT: Height = 300;

struct TestBlock(Height);

impl Block for TestBlock {
    fn height(&self) -> Height {
        self.0
    }
}

fn config() -> PoolConfig {
    PoolConfig {
        max_pending_requests: nonzero!(16_usize),
        max_requests_per_peer: nonzero!(4_usize),
        ..PoolConfig::default()
    }
}

fn drain<T>(rx: &mut Receiver<T>) -> Vec<T> {
    core::iter::from_fn(|| rx.try_next().ok().flatten()).collect()
}

#[tokio::test(start_paused = true)]
async fn blocks_are_downloaded_in_order_from_responsive_peers() -> Result<()> {
    let (channels, receivers) = Channels::bounded(1024);

    let Receivers {
        mut block_requests_rx,
        mut peer_timeouts_rx,
    } = receivers;

    let pool = BlockPool::new(config(), START_HEIGHT, channels, None)?;

    for index in 0..10 {
        pool.set_peer_height(PeerId::from(format!("peer-{index}")), TARGET_HEIGHT + index);
    }

    pool.start()?;

    let transport = tokio::spawn({
        let pool = pool.clone();

        async move {
            while let Some(BlockRequest { height, peer_id }) = block_requests_rx.next().await {
                assert!(pool.add_block(Arc::new(TestBlock(height)), peer_id));
            }
        }
    });

    let mut expected_height = START_HEIGHT;

    while expected_height < TARGET_HEIGHT {
        match pool.peek_two_blocks() {
            Some((first, second)) => {
                assert_eq!(first.height(), expected_height);
                assert_eq!(second.height(), expected_height + 1);

                assert_eq!(pool.pop_request()?.height(), expected_height);

                expected_height += 1;
            }
            None => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }

    assert_eq!(pool.height(), TARGET_HEIGHT);

    pool.stop()?;
    transport.abort();

    assert!(drain(&mut peer_timeouts_rx).is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unresponsive_peers_are_evicted() -> Result<()> {
    let (channels, mut receivers) = Channels::bounded(1024);
    let pool = BlockPool::<TestBlock>::new(config(), START_HEIGHT, channels, None)?;

    let peer_ids = ["a", "b", "c"].map(PeerId::from);

    for peer_id in &peer_ids {
        pool.set_peer_height(peer_id.clone(), TARGET_HEIGHT);
    }

    pool.start()?;

    // Every request expires after the default timeout and no peer has any budget left by then.
    tokio::time::sleep(Duration::from_secs(60)).await;

    let timed_out_peers = drain(&mut receivers.peer_timeouts_rx)
        .into_iter()
        .map(|PeerTimeout { peer_id, .. }| peer_id)
        .collect::<HashSet<_>>();

    assert_eq!(timed_out_peers, peer_ids.into_iter().collect());

    let status = pool.status();

    assert_eq!(status.peer_count, 0);
    assert_eq!(status.pending_requests, 0);
    assert_eq!(status.height, START_HEIGHT);
    assert!(!drain(&mut receivers.block_requests_rx).is_empty());

    pool.stop()?;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_pool_issues_no_requests() -> Result<()> {
    let (channels, mut receivers) = Channels::bounded(1024);
    let pool = BlockPool::<TestBlock>::new(config(), START_HEIGHT, channels, None)?;

    pool.set_peer_height(PeerId::from("a"), TARGET_HEIGHT);
    pool.start()?;

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(drain(&mut receivers.block_requests_rx).len(), 4);

    pool.stop()?;
    pool.set_peer_height(PeerId::from("b"), TARGET_HEIGHT);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!pool.is_running());
    assert!(drain(&mut receivers.block_requests_rx).is_empty());

    Ok(())
}
