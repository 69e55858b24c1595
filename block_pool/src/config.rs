use core::{num::NonZeroUsize, time::Duration};

use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::error::Error;

pub const DEFAULT_MAX_PENDING_REQUESTS: NonZeroUsize = nonzero!(300_usize);
pub const DEFAULT_MAX_REQUESTS_PER_PEER: NonZeroUsize = nonzero!(75_usize);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: usize = 2;
pub const DEFAULT_MIN_PEERS_TO_BE_CAUGHT_UP: usize = 1;

/// Tuning parameters of a [`BlockPool`](crate::BlockPool).
///
/// The right values depend on network latency and on how many peers are usually available,
/// so none of them are hardcoded in the scheduler.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Upper bound on outstanding requests plus buffered blocks.
    pub max_pending_requests: NonZeroUsize,
    pub max_requests_per_peer: NonZeroUsize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_interval: Duration,
    /// A peer is removed once it times out more than this many times in a row.
    pub max_consecutive_timeouts: usize,
    pub min_peers_to_be_caught_up: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            max_requests_per_peer: DEFAULT_MAX_REQUESTS_PER_PEER,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            min_peers_to_be_caught_up: DEFAULT_MIN_PEERS_TO_BE_CAUGHT_UP,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::ZeroDuration {
                field: "request_timeout",
            });
        }

        // `tokio::time::interval` panics when given a zero period.
        if self.tick_interval.is_zero() {
            return Err(Error::ZeroDuration {
                field: "tick_interval",
            });
        }

        Ok(())
    }

    pub(crate) fn max_pending_heights(&self) -> u64 {
        u64::try_from(self.max_pending_requests.get()).unwrap_or(u64::MAX)
    }
}
