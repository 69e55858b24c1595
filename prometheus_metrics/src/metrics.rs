use core::time::Duration;

use anyhow::Result;
use logging::warn_with_peers;
use prometheus::{histogram_opts, Histogram, IntCounter, IntGauge, Registry};

#[derive(Debug)]
pub struct Metrics {
    // Block pool state
    block_pool_peers: IntGauge,
    block_pool_pending_requests: IntGauge,
    block_pool_buffered_blocks: IntGauge,
    block_pool_height: IntGauge,

    // Block pool events
    pub block_pool_issued_requests: IntCounter,
    pub block_pool_request_timeouts: IntCounter,
    pub block_pool_evicted_peers: IntCounter,
    pub block_pool_stale_deliveries: IntCounter,
    pub block_pool_popped_blocks: IntCounter,

    block_pool_request_round_trip_times: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // Block pool state
            block_pool_peers: IntGauge::new(
                "BLOCK_POOL_PEERS",
                "Number of peers known to the block pool",
            )?,
            block_pool_pending_requests: IntGauge::new(
                "BLOCK_POOL_PENDING_REQUESTS",
                "Number of block requests awaiting a response",
            )?,
            block_pool_buffered_blocks: IntGauge::new(
                "BLOCK_POOL_BUFFERED_BLOCKS",
                "Number of received blocks not yet consumed",
            )?,
            block_pool_height: IntGauge::new(
                "BLOCK_POOL_HEIGHT",
                "Lowest height not yet consumed from the block pool",
            )?,

            // Block pool events
            block_pool_issued_requests: IntCounter::new(
                "BLOCK_POOL_ISSUED_REQUESTS",
                "Number of block requests issued to peers",
            )?,
            block_pool_request_timeouts: IntCounter::new(
                "BLOCK_POOL_REQUEST_TIMEOUTS",
                "Number of block requests that expired without a response",
            )?,
            block_pool_evicted_peers: IntCounter::new(
                "BLOCK_POOL_EVICTED_PEERS",
                "Number of peers removed after timing out repeatedly or serving a rejected block",
            )?,
            block_pool_stale_deliveries: IntCounter::new(
                "BLOCK_POOL_STALE_DELIVERIES",
                "Number of received blocks dropped because no matching request existed",
            )?,
            block_pool_popped_blocks: IntCounter::new(
                "BLOCK_POOL_POPPED_BLOCKS",
                "Number of blocks handed over to the consumer",
            )?,

            block_pool_request_round_trip_times: Histogram::with_opts(histogram_opts!(
                "BLOCK_POOL_REQUEST_ROUND_TRIP_TIMES",
                "Time between issuing a block request and accepting the block",
            ))?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.block_pool_peers.clone()))?;
        registry.register(Box::new(self.block_pool_pending_requests.clone()))?;
        registry.register(Box::new(self.block_pool_buffered_blocks.clone()))?;
        registry.register(Box::new(self.block_pool_height.clone()))?;
        registry.register(Box::new(self.block_pool_issued_requests.clone()))?;
        registry.register(Box::new(self.block_pool_request_timeouts.clone()))?;
        registry.register(Box::new(self.block_pool_evicted_peers.clone()))?;
        registry.register(Box::new(self.block_pool_stale_deliveries.clone()))?;
        registry.register(Box::new(self.block_pool_popped_blocks.clone()))?;
        registry.register(Box::new(self.block_pool_request_round_trip_times.clone()))?;

        Ok(())
    }

    pub fn set_block_pool_state(
        &self,
        peers: usize,
        pending_requests: usize,
        buffered_blocks: usize,
        height: u64,
    ) {
        set_gauge(&self.block_pool_peers, "peers", peers);
        set_gauge(
            &self.block_pool_pending_requests,
            "pending requests",
            pending_requests,
        );
        set_gauge(
            &self.block_pool_buffered_blocks,
            "buffered blocks",
            buffered_blocks,
        );
        set_gauge(&self.block_pool_height, "height", height);
    }

    pub fn observe_request_round_trip_time(&self, duration: Duration) {
        self.block_pool_request_round_trip_times
            .observe(duration.as_secs_f64());
    }
}

fn set_gauge(gauge: &IntGauge, name: &str, value: impl TryInto<i64>) {
    match value.try_into() {
        Ok(value) => gauge.set(value),
        Err(_) => warn_with_peers!("block pool {name} does not fit in a gauge"),
    }
}

#[cfg(test)]
mod tests {
    use crate::helpers;

    use super::*;

    #[test]
    fn registered_metrics_are_exported() -> Result<()> {
        let registry = Registry::new();
        let metrics = Metrics::new()?;

        metrics.register(&registry)?;
        metrics.set_block_pool_state(3, 20, 5, 42);
        metrics.block_pool_request_timeouts.inc();

        let exported = helpers::encode_registry(&registry)?;

        assert!(exported.contains("BLOCK_POOL_PEERS 3"));
        assert!(exported.contains("BLOCK_POOL_PENDING_REQUESTS 20"));
        assert!(exported.contains("BLOCK_POOL_HEIGHT 42"));
        assert!(exported.contains("BLOCK_POOL_REQUEST_TIMEOUTS 1"));

        Ok(())
    }

    #[test]
    fn metrics_cannot_be_registered_twice() -> Result<()> {
        let registry = Registry::new();
        let metrics = Metrics::new()?;

        metrics.register(&registry)?;

        assert!(matches!(metrics.register(&registry), Err(_)));

        Ok(())
    }
}
