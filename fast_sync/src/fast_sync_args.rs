use core::{fmt::Display, num::NonZeroUsize, time::Duration};
use std::path::PathBuf;

use anyhow::{ensure, Context as _, Result};
use block_pool::{Height, PoolConfig};
use clap::{error::ErrorKind, Args, CommandFactory as _, Error as ClapError, Parser};
use features::Feature;
use thiserror::Error;

use crate::fast_sync_config::{FastSyncConfig, SimulationConfig};

pub const APPLICATION_NAME: &str = "fast_sync";

const DEFAULT_PEER_COUNT: usize = 8;
const DEFAULT_START_HEIGHT: Height = 1;
const DEFAULT_TARGET_HEIGHT: Height = 2000;
const DEFAULT_MIN_LATENCY_MILLIS: u64 = 20;
const DEFAULT_MAX_LATENCY_MILLIS: u64 = 200;

/// Downloads a simulated chain through the block pool
///
/// Simulated peers answer block requests after a random delay.
/// Some of them can be made to never answer or to serve blocks that fail verification.
#[derive(Parser)]
#[clap(display_name = APPLICATION_NAME, verbatim_doc_comment)]
pub struct FastSyncArgs {
    #[clap(flatten)]
    pool_options: PoolOptions,

    #[clap(flatten)]
    simulation_options: SimulationOptions,

    /// List of optional runtime features to enable
    #[clap(long, value_delimiter = ',')]
    features: Vec<Feature>,

    /// Print Prometheus metrics after reaching the target height
    #[clap(long)]
    print_metrics: bool,
}

#[derive(Args)]
struct PoolOptions {
    /// YAML file with block pool settings.
    /// Settings passed as flags take precedence over the ones in the file.
    #[clap(long, value_name = "YAML_FILE")]
    config_file: Option<PathBuf>,

    /// Maximum number of outstanding requests plus received but unprocessed blocks
    /// [default: 300]
    #[clap(long)]
    max_pending_requests: Option<NonZeroUsize>,

    /// Maximum number of outstanding requests assigned to a single peer
    /// [default: 75]
    #[clap(long)]
    max_requests_per_peer: Option<NonZeroUsize>,

    /// Block request timeout in seconds
    /// [default: 15]
    #[clap(long, value_name = "SECONDS")]
    request_timeout: Option<u64>,

    /// Scheduler tick interval in seconds
    /// [default: 1]
    #[clap(long, value_name = "SECONDS")]
    tick_interval: Option<u64>,

    /// Number of consecutive timeouts a peer may accumulate before it is removed
    /// [default: 2]
    #[clap(long)]
    max_consecutive_timeouts: Option<usize>,

    /// Number of peers required to consider the pool caught up
    /// [default: 1]
    #[clap(long)]
    min_peers_to_be_caught_up: Option<usize>,
}

impl PoolOptions {
    fn try_into_pool_config(self) -> Result<PoolConfig> {
        let Self {
            config_file,
            max_pending_requests,
            max_requests_per_peer,
            request_timeout,
            tick_interval,
            max_consecutive_timeouts,
            min_peers_to_be_caught_up,
        } = self;

        let mut pool_config: PoolConfig = match config_file {
            Some(path) => {
                let bytes = fs_err::read(&path)?;
                serde_yaml::from_slice(bytes.as_slice())
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => PoolConfig::default(),
        };

        if let Some(max_pending_requests) = max_pending_requests {
            pool_config.max_pending_requests = max_pending_requests;
        }

        if let Some(max_requests_per_peer) = max_requests_per_peer {
            pool_config.max_requests_per_peer = max_requests_per_peer;
        }

        if let Some(request_timeout) = request_timeout {
            pool_config.request_timeout = Duration::from_secs(request_timeout);
        }

        if let Some(tick_interval) = tick_interval {
            pool_config.tick_interval = Duration::from_secs(tick_interval);
        }

        if let Some(max_consecutive_timeouts) = max_consecutive_timeouts {
            pool_config.max_consecutive_timeouts = max_consecutive_timeouts;
        }

        if let Some(min_peers_to_be_caught_up) = min_peers_to_be_caught_up {
            pool_config.min_peers_to_be_caught_up = min_peers_to_be_caught_up;
        }

        pool_config.validate()?;

        Ok(pool_config)
    }
}

#[derive(Args)]
struct SimulationOptions {
    /// Number of simulated peers
    #[clap(long, default_value_t = DEFAULT_PEER_COUNT)]
    peers: usize,

    /// Number of simulated peers that never answer
    #[clap(long, default_value_t = 0)]
    silent_peers: usize,

    /// Number of simulated peers that serve blocks failing verification
    #[clap(long, default_value_t = 0)]
    faulty_peers: usize,

    /// Height of the first block to download
    #[clap(long, default_value_t = DEFAULT_START_HEIGHT)]
    start_height: Height,

    /// Height advertised by every simulated peer
    #[clap(long, default_value_t = DEFAULT_TARGET_HEIGHT)]
    target_height: Height,

    /// Lower bound of simulated response latency in milliseconds
    #[clap(long, default_value_t = DEFAULT_MIN_LATENCY_MILLIS)]
    min_latency: u64,

    /// Upper bound of simulated response latency in milliseconds
    #[clap(long, default_value_t = DEFAULT_MAX_LATENCY_MILLIS)]
    max_latency: u64,
}

impl TryFrom<SimulationOptions> for SimulationConfig {
    type Error = anyhow::Error;

    fn try_from(simulation_options: SimulationOptions) -> Result<Self> {
        let SimulationOptions {
            peers,
            silent_peers,
            faulty_peers,
            start_height,
            target_height,
            min_latency,
            max_latency,
        } = simulation_options;

        ensure!(
            silent_peers.saturating_add(faulty_peers) < peers,
            Error::NoHonestPeers {
                peers,
                silent_peers,
                faulty_peers,
            },
        );

        ensure!(
            start_height < target_height,
            Error::TargetHeightNotAboveStartHeight {
                start_height,
                target_height,
            },
        );

        ensure!(
            min_latency <= max_latency,
            Error::InvalidLatencyRange {
                min_latency,
                max_latency,
            },
        );

        Ok(Self {
            peer_count: peers,
            silent_peer_count: silent_peers,
            faulty_peer_count: faulty_peers,
            start_height,
            target_height,
            latency: Duration::from_millis(min_latency)..=Duration::from_millis(max_latency),
        })
    }
}

impl FastSyncArgs {
    pub fn try_into_config(self) -> Result<FastSyncConfig> {
        let Self {
            pool_options,
            simulation_options,
            features,
            print_metrics,
        } = self;

        let pool_config = pool_options.try_into_pool_config()?;
        let simulation_config = simulation_options.try_into()?;

        features.iter().for_each(|feature| feature.enable());

        Ok(FastSyncConfig {
            pool_config,
            simulation_config,
            features,
            print_metrics,
        })
    }

    pub fn clap_error(message: impl Display) -> ClapError {
        Self::command().error(ErrorKind::ValueValidation, message)
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error(
        "at least one peer must be honest \
         (peers: {peers}, silent peers: {silent_peers}, faulty peers: {faulty_peers})"
    )]
    NoHonestPeers {
        peers: usize,
        silent_peers: usize,
        faulty_peers: usize,
    },
    #[error(
        "target height must be above start height \
         (start height: {start_height}, target height: {target_height})"
    )]
    TargetHeightNotAboveStartHeight {
        start_height: Height,
        target_height: Height,
    },
    #[error(
        "minimum latency must not exceed maximum latency \
         (minimum: {min_latency} ms, maximum: {max_latency} ms)"
    )]
    InvalidLatencyRange { min_latency: u64, max_latency: u64 },
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use block_pool::{DEFAULT_MAX_REQUESTS_PER_PEER, DEFAULT_REQUEST_TIMEOUT};
    use nonzero_ext::nonzero;
    use tempfile::NamedTempFile;

    use super::*;

    fn try_config_from_args<'a>(
        arguments: impl IntoIterator<Item = &'a str>,
    ) -> Result<FastSyncConfig> {
        FastSyncArgs::try_parse_from(core::iter::once(APPLICATION_NAME).chain(arguments))?
            .try_into_config()
    }

    #[test]
    fn defaults_are_used_when_no_flags_are_given() -> Result<()> {
        let config = try_config_from_args([])?;

        assert_eq!(config.pool_config, PoolConfig::default());
        assert_eq!(
            config.simulation_config,
            SimulationConfig {
                peer_count: DEFAULT_PEER_COUNT,
                silent_peer_count: 0,
                faulty_peer_count: 0,
                start_height: DEFAULT_START_HEIGHT,
                target_height: DEFAULT_TARGET_HEIGHT,
                latency: Duration::from_millis(DEFAULT_MIN_LATENCY_MILLIS)
                    ..=Duration::from_millis(DEFAULT_MAX_LATENCY_MILLIS),
            },
        );
        assert!(config.features.is_empty());
        assert!(!config.print_metrics);

        Ok(())
    }

    #[test]
    fn flags_take_precedence_over_config_file() -> Result<()> {
        let mut config_file = NamedTempFile::new()?;

        config_file.write_all(b"max_pending_requests: 64\nrequest_timeout: 5\n")?;

        let path = config_file.path().to_str().context("temporary path is not UTF-8")?;

        let config = try_config_from_args([
            "--config-file",
            path,
            "--max-pending-requests",
            "32",
            "--tick-interval",
            "2",
        ])?;

        assert_eq!(
            config.pool_config,
            PoolConfig {
                max_pending_requests: nonzero!(32_usize),
                max_requests_per_peer: DEFAULT_MAX_REQUESTS_PER_PEER,
                request_timeout: Duration::from_secs(5),
                tick_interval: Duration::from_secs(2),
                ..PoolConfig::default()
            },
        );

        assert_ne!(config.pool_config.request_timeout, DEFAULT_REQUEST_TIMEOUT);

        Ok(())
    }

    #[test]
    fn zero_request_timeout_is_rejected() {
        assert!(matches!(
            try_config_from_args(["--request-timeout", "0"]),
            Err(_),
        ));
    }

    #[test]
    fn at_least_one_peer_must_be_honest() {
        assert!(matches!(
            try_config_from_args(["--peers", "3", "--silent-peers", "2", "--faulty-peers", "1"]),
            Err(_),
        ));
    }

    #[test]
    fn target_height_must_be_above_start_height() {
        assert!(matches!(
            try_config_from_args(["--start-height", "10", "--target-height", "10"]),
            Err(_),
        ));
    }

    #[test]
    fn features_are_parsed_from_comma_separated_list() -> Result<()> {
        let config = try_config_from_args(["--features", "DebugBlockPool,LogPoolStatus"])?;

        assert_eq!(
            config.features,
            [Feature::DebugBlockPool, Feature::LogPoolStatus],
        );

        Feature::DebugBlockPool.disable();
        Feature::LogPoolStatus.disable();

        Ok(())
    }
}
