pub use crate::{
    config::{
        PoolConfig, DEFAULT_MAX_CONSECUTIVE_TIMEOUTS, DEFAULT_MAX_PENDING_REQUESTS,
        DEFAULT_MAX_REQUESTS_PER_PEER, DEFAULT_MIN_PEERS_TO_BE_CAUGHT_UP, DEFAULT_REQUEST_TIMEOUT,
        DEFAULT_TICK_INTERVAL,
    },
    error::Error,
    messages::{BlockRequest, Channels, PeerTimeout, Receivers},
    misc::{Block, Height, PeerId},
    pool::{BlockPool, PoolStatus},
};

mod config;
mod error;
mod messages;
mod misc;
mod peers;
mod pool;
mod requests;
