//! `TransactionalStore` / `StoreBatch` — the storage contract the core
//! requires, plus an in-memory implementation for tests and ephemeral runs.
//!
//! A batch is a scoped, exclusively-owned transaction handle:
//! open → read checkpoint → apply mutations → write checkpoint → commit
//! (all effects durable) or close without commit (all effects discarded).

use async_trait::async_trait;

use crate::error::StoreError;

/// An open transactional batch.
///
/// Mutations and the height checkpoint written through one batch become
/// durable together on `commit`, or not at all.
#[async_trait]
pub trait StoreBatch: Send {
    /// Read the persisted `last_processed_height` for a chain (0 if unset).
    async fn last_processed_height(&mut self, chain_id: u64) -> Result<u64, StoreError>;

    /// Stage a new `last_processed_height` for a chain.
    async fn set_last_processed_height(
        &mut self,
        chain_id: u64,
        height: u64,
    ) -> Result<(), StoreError>;

    /// Execute mutating statements inside the batch.
    async fn exec_write_queries(&mut self, statements: &[String]) -> Result<(), StoreError>;

    /// Make all staged effects durable.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the batch if it is still open. Safe to call on an aborted or
    /// already-closed batch.
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// A store that hands out exclusive transactional batches.
///
/// The core assumes single-writer access: one ingestion daemon per store.
///
/// Implementations that execute statements (rather than record them, as
/// [`MemoryStore`] does) must provide the
/// `table_owners (table_id INTEGER PRIMARY KEY, owner TEXT NOT NULL)`
/// table: ownership transfers are applied through
/// [`crate::daemon::ownership_statement`], which upserts into it.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn open_batch(&self) -> Result<Box<dyn StoreBatch>, StoreError>;
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryState {
    heights: HashMap<u64, u64>,
    /// Committed statements, in execution order.
    statements: Vec<String>,
    /// Every checkpoint value ever committed, in commit order.
    height_history: Vec<u64>,
}

/// In-memory `TransactionalStore` for tests and ephemeral ingestion.
///
/// Statements are recorded, not executed; `statements()` exposes them in
/// committed order so tests can assert on applied mutations.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed statements in execution order.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    /// Committed checkpoint for a chain (0 if unset).
    pub fn height(&self, chain_id: u64) -> u64 {
        self.state
            .lock()
            .unwrap()
            .heights
            .get(&chain_id)
            .copied()
            .unwrap_or(0)
    }

    /// Every checkpoint value committed so far, in commit order.
    pub fn height_history(&self) -> Vec<u64> {
        self.state.lock().unwrap().height_history.clone()
    }

    /// Seed a committed checkpoint (test setup).
    pub fn set_height(&self, chain_id: u64, height: u64) {
        self.state.lock().unwrap().heights.insert(chain_id, height);
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn open_batch(&self) -> Result<Box<dyn StoreBatch>, StoreError> {
        Ok(Box::new(MemoryBatch {
            state: Arc::clone(&self.state),
            staged_statements: Vec::new(),
            staged_heights: HashMap::new(),
            open: true,
        }))
    }
}

struct MemoryBatch {
    state: Arc<Mutex<MemoryState>>,
    staged_statements: Vec<String>,
    staged_heights: HashMap<u64, u64>,
    open: bool,
}

impl MemoryBatch {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::BatchClosed)
        }
    }
}

#[async_trait]
impl StoreBatch for MemoryBatch {
    async fn last_processed_height(&mut self, chain_id: u64) -> Result<u64, StoreError> {
        self.ensure_open()?;
        if let Some(h) = self.staged_heights.get(&chain_id) {
            return Ok(*h);
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .heights
            .get(&chain_id)
            .copied()
            .unwrap_or(0))
    }

    async fn set_last_processed_height(
        &mut self,
        chain_id: u64,
        height: u64,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.staged_heights.insert(chain_id, height);
        Ok(())
    }

    async fn exec_write_queries(&mut self, statements: &[String]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.staged_statements.extend_from_slice(statements);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.statements.append(&mut self.staged_statements);
        for (chain_id, height) in self.staged_heights.drain() {
            state.heights.insert(chain_id, height);
            state.height_history.push(height);
        }
        self.open = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.staged_statements.clear();
        self.staged_heights.clear();
        self.open = false;
        Ok(())
    }
}
