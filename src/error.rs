//! Error types for shardlimit operations.

use thiserror::Error;

/// Errors surfaced by the backing store.
///
/// `Conflict` is special: the limiter retries the whole read-compute-write
/// cycle on conflict and never returns it to callers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A conditional commit lost a race with a concurrent writer.
    #[error("optimistic concurrency conflict")]
    Conflict,

    /// The store itself failed (I/O, connection, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimitError {
    /// Unknown limit name, or nonsensical parameters. Fatal, never retried.
    #[error("invalid limit configuration: {0}")]
    InvalidConfig(String),

    /// Store failure other than an internally-retried conflict.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimitError>;
