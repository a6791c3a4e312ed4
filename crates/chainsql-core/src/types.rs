//! Shared types for the ingestion pipeline.

use serde::{Deserialize, Serialize};

use crate::event::TableEvent;

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// A minimal header delivered by the new-head subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
}

// ─── LogEntry ─────────────────────────────────────────────────────────────────

/// A raw, undecoded chain log as returned by `eth_getLogs`.
///
/// `topics[0]` is the keccak256 hash of the event signature; `topics[1..]`
/// carry ABI-encoded indexed arguments; `data` carries the ABI-encoded
/// non-indexed arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Contract address that emitted the log.
    pub address: String,
    /// Ordered topic hashes (`0x…`, 32 bytes each).
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed arguments.
    pub data: Vec<u8>,
    /// Block number the log was included in.
    pub block_number: u64,
    /// Transaction hash.
    pub tx_hash: String,
    /// Transaction index within the block.
    pub tx_index: u32,
    /// Log index within the block.
    pub log_index: u32,
}

// ─── BlockEvents ──────────────────────────────────────────────────────────────

/// All decoded events of a single block, preserving chain log order.
///
/// Across one feed run, `BlockEvents` values are emitted in strictly
/// increasing `block_number` order, each number at most once.
#[derive(Debug, Clone)]
pub struct BlockEvents {
    pub block_number: u64,
    pub events: Vec<TableEvent>,
}
