//! SQLite-backed `TransactionalStore` implementation.
//!
//! One shared connection behind an `Arc<Mutex<..>>`, WAL mode enabled.
//! A batch maps directly onto a SQLite transaction: `BEGIN IMMEDIATE` on
//! open, `COMMIT` on commit, `ROLLBACK` on close. The store assumes a
//! single writer, so batch operations never contend on the write lock.
//!
//! ## Schema
//! ```sql
//! CREATE TABLE system_processed_height (
//!     chain_id     INTEGER PRIMARY KEY,
//!     block_number INTEGER NOT NULL,
//!     updated_at   INTEGER NOT NULL
//! );
//! CREATE TABLE table_owners (
//!     table_id INTEGER PRIMARY KEY,
//!     owner    TEXT NOT NULL
//! );
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use chainsql_core::error::StoreError;
use chainsql_core::store::{StoreBatch, TransactionalStore};

use crate::hash::{database_state_hash, StateHashConfig};

/// SQLite-backed store.
///
/// Thread-safe via an internal `Arc<Mutex<Connection>>`; cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store database at the given path.
    ///
    /// Enables WAL mode and creates the system tables on first open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Storage(format!("sqlite open error: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(sqlite_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS system_processed_height (
                chain_id     INTEGER PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS table_owners (
                table_id INTEGER PRIMARY KEY,
                owner    TEXT NOT NULL
            );",
        )
        .map_err(sqlite_err)?;

        debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Every persisted checkpoint as `(chain_id, block_number)` pairs,
    /// ordered by chain id.
    pub fn processed_heights(&self) -> Result<Vec<(u64, u64)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT chain_id, block_number FROM system_processed_height
                 ORDER BY chain_id",
            )
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)))
            .map_err(sqlite_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sqlite_err)
    }

    /// Current owner of a table, if any.
    pub fn table_owner(&self, table_id: u64) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT owner FROM table_owners WHERE table_id = ?1",
            params![table_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(sqlite_err)
    }

    /// Canonical digest of the user-visible database state.
    pub fn state_hash(&self, config: &StateHashConfig) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        database_state_hash(&conn, config)
    }
}

#[async_trait]
impl TransactionalStore for SqliteStore {
    async fn open_batch(&self) -> Result<Box<dyn StoreBatch>, StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").map_err(sqlite_err)?;
        }
        Ok(Box::new(SqliteBatch {
            conn: Arc::clone(&self.conn),
            open: true,
        }))
    }
}

struct SqliteBatch {
    conn: Arc<Mutex<Connection>>,
    open: bool,
}

impl SqliteBatch {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::BatchClosed)
        }
    }
}

#[async_trait]
impl StoreBatch for SqliteBatch {
    async fn last_processed_height(&mut self, chain_id: u64) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        let height: Option<u64> = conn
            .query_row(
                "SELECT block_number FROM system_processed_height WHERE chain_id = ?1",
                params![chain_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        Ok(height.unwrap_or(0))
    }

    async fn set_last_processed_height(
        &mut self,
        chain_id: u64,
        height: u64,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system_processed_height (chain_id, block_number, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id) DO UPDATE SET
                block_number = excluded.block_number,
                updated_at   = excluded.updated_at",
            params![chain_id, height, Utc::now().timestamp()],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    async fn exec_write_queries(&mut self, statements: &[String]) -> Result<(), StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        for statement in statements {
            conn.execute_batch(statement).map_err(sqlite_err)?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.open = false;
                Ok(())
            }
            Err(e) => {
                // A failed COMMIT can leave the transaction active on the
                // shared connection; roll it back so the next batch can
                // start. Ignore the rollback result: some commit failures
                // already aborted the transaction.
                let _ = conn.execute_batch("ROLLBACK");
                self.open = false;
                Err(sqlite_err(e))
            }
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK").map_err(sqlite_err)
    }
}

impl Drop for SqliteBatch {
    fn drop(&mut self) {
        // Never leave a transaction open on the shared connection.
        if self.open {
            let _ = self.conn.lock().unwrap().execute_batch("ROLLBACK");
        }
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn sqlite_err(e: rusqlite::Error) -> StoreError {
    StoreError::Storage(format!("sqlite error: {e}"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_persists_mutations_and_checkpoint_together() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        batch
            .exec_write_queries(&[
                "CREATE TABLE t (x int)".into(),
                "INSERT INTO t VALUES (1)".into(),
            ])
            .await
            .unwrap();
        batch.set_last_processed_height(1, 100).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.processed_heights().unwrap(), vec![(1, 100)]);
        let count: u64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn close_without_commit_discards_everything() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        batch
            .exec_write_queries(&["CREATE TABLE t (x int)".into()])
            .await
            .unwrap();
        batch.set_last_processed_height(1, 7).await.unwrap();
        batch.close().await.unwrap();

        assert!(store.processed_heights().unwrap().is_empty());
        let table_exists: u64 = store
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(table_exists, 0);

        // Safe to close twice
        batch.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_batch_rejects_operations() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        batch.commit().await.unwrap();
        assert!(matches!(
            batch.last_processed_height(1).await,
            Err(StoreError::BatchClosed)
        ));
    }

    #[tokio::test]
    async fn checkpoints_are_scoped_per_chain() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        batch.set_last_processed_height(1, 100).await.unwrap();
        batch.set_last_processed_height(5, 900).await.unwrap();
        assert_eq!(batch.last_processed_height(1).await.unwrap(), 100);
        assert_eq!(batch.last_processed_height(5).await.unwrap(), 900);
        assert_eq!(batch.last_processed_height(9).await.unwrap(), 0);
        batch.commit().await.unwrap();

        assert_eq!(store.processed_heights().unwrap(), vec![(1, 100), (5, 900)]);
    }

    #[tokio::test]
    async fn invalid_sql_surfaces_a_storage_error() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        let err = batch
            .exec_write_queries(&["NOT REALLY SQL".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        batch.close().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_update_overwrites_prior_value() {
        let store = SqliteStore::in_memory().unwrap();

        let mut batch = store.open_batch().await.unwrap();
        batch.set_last_processed_height(1, 100).await.unwrap();
        batch.commit().await.unwrap();

        let mut batch = store.open_batch().await.unwrap();
        assert_eq!(batch.last_processed_height(1).await.unwrap(), 100);
        batch.set_last_processed_height(1, 101).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.processed_heights().unwrap(), vec![(1, 101)]);
    }

    #[tokio::test]
    async fn failed_commit_leaves_connection_usable() {
        let store = SqliteStore::in_memory().unwrap();
        // A deferred foreign key violation surfaces at COMMIT time, the
        // same shape as a late SQLITE_BUSY or I/O failure.
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE parents (id INTEGER PRIMARY KEY);
                 CREATE TABLE children (
                     parent_id INTEGER REFERENCES parents(id)
                         DEFERRABLE INITIALLY DEFERRED
                 );",
            )
            .unwrap();

        let mut batch = store.open_batch().await.unwrap();
        batch
            .exec_write_queries(&["INSERT INTO children VALUES (999)".into()])
            .await
            .unwrap();
        batch.set_last_processed_height(1, 100).await.unwrap();
        let err = batch.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
        batch.close().await.unwrap();

        // The transaction was rolled back: a fresh batch can begin and the
        // failed batch's effects are gone.
        let mut batch = store.open_batch().await.unwrap();
        assert_eq!(batch.last_processed_height(1).await.unwrap(), 0);
        batch.set_last_processed_height(1, 1).await.unwrap();
        batch.commit().await.unwrap();

        let orphans: u64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM children", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
        assert_eq!(store.processed_heights().unwrap(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn ownership_statement_applies_against_the_schema() {
        let store = SqliteStore::in_memory().unwrap();
        let mut batch = store.open_batch().await.unwrap();
        batch
            .exec_write_queries(&[chainsql_core::ownership_statement("0xaa", 7)])
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.table_owner(7).unwrap(), Some("0xaa".into()));
        assert_eq!(store.table_owner(8).unwrap(), None);

        // A later transfer overwrites the owner.
        let mut batch = store.open_batch().await.unwrap();
        batch
            .exec_write_queries(&[chainsql_core::ownership_statement("0xbb", 7)])
            .await
            .unwrap();
        batch.commit().await.unwrap();
        assert_eq!(store.table_owner(7).unwrap(), Some("0xbb".into()));
    }
}
