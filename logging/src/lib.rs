use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use derive_more::Display;

pub static SYNC_LOG_METRICS: SyncLogMetrics = SyncLogMetrics::new();

/// Sync progress shown in front of every message logged with the `*_with_peers!` macros.
#[derive(Display, Debug)]
#[display("peers: {peer_count:?}, height: {height:?}")]
pub struct SyncLogMetrics {
    peer_count: AtomicUsize,
    height: AtomicU64,
}

impl SyncLogMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            peer_count: AtomicUsize::new(0),
            height: AtomicU64::new(0),
        }
    }

    pub fn set_peer_count(&self, peer_count: usize) {
        self.peer_count.store(peer_count, Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed)
    }
}

impl Default for SyncLogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! info_with_peers {
    ($($arg:tt)*) => {
        ::tracing::info!("[{}] {}", $crate::SYNC_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! debug_with_peers {
    ($($arg:tt)*) => {
        ::tracing::debug!("[{}] {}", $crate::SYNC_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! warn_with_peers {
    ($($arg:tt)*) => {
        ::tracing::warn!("[{}] {}", $crate::SYNC_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! error_with_peers {
    ($($arg:tt)*) => {
        ::tracing::error!("[{}] {}", $crate::SYNC_LOG_METRICS, format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! trace_with_peers {
    ($($arg:tt)*) => {
        ::tracing::trace!("[{}] {}", $crate::SYNC_LOG_METRICS, format_args!($($arg)*));
    };
}
