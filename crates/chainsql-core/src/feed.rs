//! `EventFeed` trait — abstraction over the chain event source.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::event::EventKind;
use crate::types::BlockEvents;

/// A source of per-block event groups.
///
/// # Contract
///
/// `start` runs until `shutdown` is cancelled (returns `Ok(())`) or a fatal
/// error occurs (returns `Err`). It never emits a block number below
/// `from_height`, never emits the same block number twice within one run,
/// and never emits blocks out of order. Sends on `output` block when the
/// consumer is slow, throttling log fetching naturally.
#[async_trait]
pub trait EventFeed: Send + Sync {
    async fn start(
        &self,
        shutdown: CancellationToken,
        from_height: u64,
        output: mpsc::Sender<BlockEvents>,
        kinds: &[EventKind],
    ) -> Result<(), FeedError>;
}
