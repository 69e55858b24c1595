use core::{ops::RangeInclusive, time::Duration};

use block_pool::{Height, PoolConfig};
use features::Feature;

#[derive(Clone, PartialEq, Debug)]
pub struct FastSyncConfig {
    pub pool_config: PoolConfig,
    pub simulation_config: SimulationConfig,
    pub features: Vec<Feature>,
    pub print_metrics: bool,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SimulationConfig {
    pub peer_count: usize,
    pub silent_peer_count: usize,
    pub faulty_peer_count: usize,
    pub start_height: Height,
    pub target_height: Height,
    pub latency: RangeInclusive<Duration>,
}
