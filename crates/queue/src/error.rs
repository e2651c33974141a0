//! Queue error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("'{0}' is already active in another process")]
    AlreadyActive(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("unacked packages found")]
    HasUnacked,

    #[error("no unacked packages found")]
    NoUnacked,

    #[error("package was fetched in a batch, use multi_ack")]
    CannotAckInBatch,

    #[error("package was not fetched in a batch, use ack")]
    CannotAckSingle,

    #[error("cannot reject a package while earlier batch packages are unacked")]
    PriorUnacked,

    #[error("queue has active consumers")]
    HasActiveConsumers,

    #[error("corrupt package: {0}")]
    CorruptPackage(#[from] serde_json::Error),

    #[error("buffered queue is not running")]
    NotRunning,

    #[error("datastore error: {0}")]
    Datastore(#[from] redis::RedisError),
}
