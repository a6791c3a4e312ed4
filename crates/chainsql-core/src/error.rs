//! Error types for the ChainSQL pipeline.

use thiserror::Error;

/// Errors surfaced by a [`crate::store::TransactionalStore`] or its batches.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("batch is no longer open")]
    BatchClosed,
}

/// Errors from the SQL validation collaborator.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("failed to parse statement: {0}")]
    Parse(String),

    #[error("statement not allowed: {0}")]
    Disallowed(String),
}

/// Errors turning a raw chain log into a [`crate::event::TableEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event signature: {topic0}")]
    UnknownSignature { topic0: String },

    #[error("ABI decode failed: {reason}")]
    Abi { reason: String },
}

/// Errors from the event feed. Any of these is fatal to the run;
/// transient log-query failures are retried internally and never surface.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("new-head subscription failed: {0}")]
    Subscribe(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Errors from the ingestion daemon's lifecycle operations.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon already started")]
    AlreadyStarted,

    #[error("startup checkpoint read timed out")]
    StartupTimeout,

    #[error(transparent)]
    Store(#[from] StoreError),
}
