//! Error types for forkpool.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// A submission argument was rejected before any worker was touched.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The pool is shutting down; the submission was not accepted.
    #[error("pool is shutting down")]
    PoolStopped,

    /// No worker became idle within the acquire timeout.
    #[error("timed out waiting for an idle worker")]
    CheckoutTimeout,

    /// The worker reported a task failure. The message carries the remote
    /// error text and, when available, the remote stack trace.
    #[error("task failed on worker: {0}")]
    Task(String),

    /// The worker exited or closed its pipes before responding.
    #[error("worker died before responding")]
    WorkerDead,

    /// A message id was collected that is not in the pending table.
    #[error("unknown message id {0}")]
    UnknownMsgId(u64),

    /// A worker subprocess could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
