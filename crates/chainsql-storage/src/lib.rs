//! chainsql-storage — durable storage for ChainSQL.
//!
//! [`SqliteStore`] implements the core's `TransactionalStore` contract over
//! a single SQLite database, and [`database_state_hash`] produces the
//! canonical digest used to compare replicas.

pub mod hash;
pub mod sqlite;

pub use hash::{database_state_hash, StateHashConfig, DEFAULT_DISCOVERY_QUERY};
pub use sqlite::SqliteStore;
