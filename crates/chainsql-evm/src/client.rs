//! `ChainClient` trait — abstraction over an EVM JSON-RPC provider.
//!
//! The core only needs two operations: a new-head subscription and ranged
//! log retrieval. How the provider implements them (WS, HTTP polling) is
//! outside this crate's scope.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use chainsql_core::types::{BlockHeader, LogEntry};

/// A stream of new-head notifications from a single chain.
pub type HeaderStream = Pin<Box<dyn Stream<Item = Result<BlockHeader, ClientError>> + Send>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("subscription error: {0}")]
    Subscribe(String),
}

/// Log retrieval filter. Empty `topic0` matches all events.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub address: String,
    pub topic0: Vec<String>,
    /// Start block (inclusive).
    pub from_block: u64,
    /// End block (inclusive).
    pub to_block: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Subscribe to new-head notifications.
    async fn subscribe_new_heads(&self) -> Result<HeaderStream, ClientError>;

    /// Fetch all logs matching `filter`, ordered by block number then log
    /// index, as EVM nodes return them.
    async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, ClientError>;
}
