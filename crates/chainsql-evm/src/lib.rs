//! chainsql-evm — the EVM side of ChainSQL.
//!
//! Provides the [`ChainClient`] seam over a JSON-RPC provider, the ABI
//! decoding registry for registry-contract events, and [`EvmEventFeed`],
//! the reorg-safe `EventFeed` implementation the ingestion daemon runs.

pub mod client;
pub mod decode;
pub mod feed;

pub use client::{ChainClient, ClientError, HeaderStream, LogFilter};
pub use decode::EventDecoder;
pub use feed::EvmEventFeed;
