use thiserror::Error;

use crate::misc::Height;

#[derive(Debug, Error)]
pub enum Error {
    #[error("block pool is already running")]
    AlreadyStarted,
    #[error("block pool has been stopped and cannot be restarted")]
    AlreadyStopped,
    #[error("block pool must be started from within a Tokio runtime")]
    NoRuntime,
    #[error("block at height {height} has not been received yet")]
    NotReady { height: Height },
    #[error("request for height {height} already exists")]
    DuplicateRequest { height: Height },
    #[error("no block is buffered at height {height}")]
    NoBufferedBlock { height: Height },
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}
