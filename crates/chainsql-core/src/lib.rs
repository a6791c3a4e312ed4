//! chainsql-core — turn an append-only, reorganizing chain event log into
//! deterministic, exactly-once mutations over a relational store.
//!
//! # Architecture
//!
//! ```text
//! EventFeed (chainsql-evm)
//!     └── per-block event groups, reorg-safe window behind the head
//! IngestionDaemon
//!     ├── SqlValidator        (statement classification, collaborator)
//!     └── TransactionalStore  (atomic mutations + height checkpoint)
//! StateHasher (chainsql-storage)
//!     └── canonical digest for replica comparison
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod feed;
pub mod store;
pub mod types;
pub mod validator;

pub use config::FeedConfig;
pub use daemon::{ownership_statement, IngestionDaemon};
pub use error::{DaemonError, DecodeError, FeedError, StoreError, ValidationError};
pub use event::{EventKind, TableEvent};
pub use feed::EventFeed;
pub use store::{MemoryStore, StoreBatch, TransactionalStore};
pub use types::{BlockEvents, BlockHeader, LogEntry};
pub use validator::{SqlValidator, ValidatedSql};
