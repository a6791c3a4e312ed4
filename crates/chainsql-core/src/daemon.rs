//! The ingestion daemon — applies per-block event batches to the store.
//!
//! One background task per instance. Each received block is applied inside a
//! single batch that also advances the persisted height checkpoint, so the
//! checkpoint and the block's mutations become durable together or not at
//! all. If a batch aborts, the checkpoint is untouched and the same height
//! is reprocessed from unmutated state on the next attempt — this is the
//! primary crash-recovery mechanism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{DaemonError, FeedError, StoreError};
use crate::event::{EventKind, TableEvent};
use crate::feed::EventFeed;
use crate::store::{StoreBatch, TransactionalStore};
use crate::types::BlockEvents;
use crate::validator::{SqlValidator, ValidatedSql};

/// Bound on the startup checkpoint read, so start/stop cannot hang on a
/// slow store.
const STARTUP_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the feed → daemon channel. Small so a slow apply path
/// throttles log fetching.
const BLOCK_CHANNEL_CAPACITY: usize = 1;

enum Lifecycle {
    Stopped,
    Running {
        shutdown: CancellationToken,
        worker: JoinHandle<()>,
    },
}

/// Owns the single ingestion task for one chain.
pub struct IngestionDaemon {
    store: Arc<dyn TransactionalStore>,
    feed: Arc<dyn EventFeed>,
    validator: Arc<dyn SqlValidator>,
    chain_id: u64,
    kinds: Vec<EventKind>,
    lifecycle: Mutex<Lifecycle>,
}

impl IngestionDaemon {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        feed: Arc<dyn EventFeed>,
        validator: Arc<dyn SqlValidator>,
        chain_id: u64,
        kinds: Vec<EventKind>,
    ) -> Self {
        Self {
            store,
            feed,
            validator,
            chain_id,
            kinds,
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Start the background ingestion task.
    ///
    /// Reads the persisted checkpoint (bounded deadline) and starts the feed
    /// from `checkpoint + 1`. Returns `DaemonError::AlreadyStarted` if the
    /// daemon is already running.
    pub async fn start_sync(&self) -> Result<(), DaemonError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running { .. }) {
            return Err(DaemonError::AlreadyStarted);
        }

        let from_height = self.read_start_height().await? + 1;

        let shutdown = CancellationToken::new();
        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);

        let feed = Arc::clone(&self.feed);
        let feed_shutdown = shutdown.clone();
        let kinds = self.kinds.clone();
        let feed_handle = tokio::spawn(async move {
            feed.start(feed_shutdown, from_height, block_tx, &kinds).await
        });

        let store = Arc::clone(&self.store);
        let validator = Arc::clone(&self.validator);
        let chain_id = self.chain_id;
        let worker_shutdown = shutdown.clone();
        let worker = tokio::spawn(async move {
            run_loop(store, validator, chain_id, block_rx, feed_handle, worker_shutdown).await;
        });

        info!(chain = self.chain_id, from_height, "ingestion started");
        *lifecycle = Lifecycle::Running { shutdown, worker };
        Ok(())
    }

    /// Stop the background task and wait for it to fully exit.
    ///
    /// No-op if the daemon is not running. Serialized with `start_sync`
    /// through the lifecycle lock, so concurrent start/stop calls cannot
    /// race, and the task is guaranteed gone once this returns.
    pub async fn stop_sync(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Running { shutdown, worker } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return;
        };
        shutdown.cancel();
        if let Err(e) = worker.await {
            error!(error = %e, "ingestion worker panicked");
        }
        info!(chain = self.chain_id, "ingestion stopped");
    }

    async fn read_start_height(&self) -> Result<u64, DaemonError> {
        let mut batch = self.store.open_batch().await?;
        let height = match timeout(
            STARTUP_READ_TIMEOUT,
            batch.last_processed_height(self.chain_id),
        )
        .await
        {
            Ok(Ok(height)) => height,
            Ok(Err(e)) => {
                let _ = batch.close().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = batch.close().await;
                return Err(DaemonError::StartupTimeout);
            }
        };
        batch.close().await?;
        Ok(height)
    }
}

async fn run_loop(
    store: Arc<dyn TransactionalStore>,
    validator: Arc<dyn SqlValidator>,
    chain_id: u64,
    mut blocks: mpsc::Receiver<BlockEvents>,
    feed_handle: JoinHandle<Result<(), FeedError>>,
    shutdown: CancellationToken,
) {
    let mut feed_handle = Some(feed_handle);
    loop {
        let block = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = blocks.recv() => match received {
                Some(block) => block,
                None => {
                    // Feed ended on its own: join it, surface the cause, and
                    // self-stop. Composes with an external stop_sync because
                    // cancel is idempotent and the worker join still happens
                    // there.
                    if let Some(handle) = feed_handle.take() {
                        join_feed(handle).await;
                    }
                    shutdown.cancel();
                    break;
                }
            },
        };

        if let Err(e) = process_block(&*store, &*validator, chain_id, &block).await {
            error!(
                chain = chain_id,
                block = block.block_number,
                error = %e,
                "failed to apply block; stopping ingestion"
            );
            shutdown.cancel();
            break;
        }
    }

    // Let a feed blocked on send observe the closed channel or cancellation,
    // then join it before the worker exits.
    drop(blocks);
    if let Some(handle) = feed_handle.take() {
        join_feed(handle).await;
    }
}

async fn join_feed(handle: JoinHandle<Result<(), FeedError>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "event feed terminated with fatal error"),
        Err(e) => error!(error = %e, "event feed task panicked"),
    }
}

async fn process_block(
    store: &dyn TransactionalStore,
    validator: &dyn SqlValidator,
    chain_id: u64,
    block: &BlockEvents,
) -> Result<(), StoreError> {
    let mut batch = store.open_batch().await?;
    match apply_block(batch.as_mut(), validator, chain_id, block).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(close_err) = batch.close().await {
                warn!(error = %close_err, "failed to close aborted batch");
            }
            Err(e)
        }
    }
}

async fn apply_block(
    batch: &mut dyn StoreBatch,
    validator: &dyn SqlValidator,
    chain_id: u64,
    block: &BlockEvents,
) -> Result<(), StoreError> {
    let checkpoint = batch.last_processed_height(chain_id).await?;
    if block.block_number <= checkpoint {
        // Unreachable given the feed's ordering contract; defense in depth.
        error!(
            chain = chain_id,
            block = block.block_number,
            checkpoint,
            "received block at or below checkpoint; discarding whole block"
        );
        return batch.close().await;
    }

    let mut applied = 0usize;
    let mut skipped = 0usize;
    for (index, event) in block.events.iter().enumerate() {
        match event {
            TableEvent::RunSql {
                statement, table_id, ..
            } => match validator.validate_run_sql(statement) {
                Ok(ValidatedSql::Mutations(statements)) => {
                    batch.exec_write_queries(&statements).await?;
                    applied += 1;
                }
                Ok(ValidatedSql::ReadQuery(_)) => {
                    warn!(
                        chain = chain_id,
                        block = block.block_number,
                        event = index,
                        table = table_id,
                        "read-only statement in mutation event; skipping"
                    );
                    skipped += 1;
                }
                Err(e) => {
                    warn!(
                        chain = chain_id,
                        block = block.block_number,
                        event = index,
                        table = table_id,
                        error = %e,
                        "statement failed validation; skipping"
                    );
                    skipped += 1;
                }
            },
            TableEvent::TransferTable { to, table_id, .. } => {
                batch
                    .exec_write_queries(&[ownership_statement(to, *table_id)])
                    .await?;
                applied += 1;
            }
        }
    }

    batch.set_last_processed_height(chain_id, block.block_number).await?;
    batch.commit().await?;
    info!(
        chain = chain_id,
        block = block.block_number,
        applied,
        skipped,
        "block committed"
    );
    Ok(())
}

/// The mutation a `TransferTable` event applies.
///
/// Targets the `table_owners (table_id INTEGER PRIMARY KEY, owner TEXT)`
/// table, which every SQL-executing `TransactionalStore` implementation
/// must provide (see the trait docs in [`crate::store`]).
pub fn ownership_statement(to: &str, table_id: u64) -> String {
    format!(
        "INSERT INTO table_owners (table_id, owner) VALUES ({table_id}, '{to}') \
         ON CONFLICT(table_id) DO UPDATE SET owner = excluded.owner"
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────
