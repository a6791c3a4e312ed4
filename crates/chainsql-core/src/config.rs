//! Feed configuration.

use serde::{Deserialize, Serialize};

/// Configuration for an event feed instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Chain identifier, used to scope the persisted checkpoint.
    pub chain_id: u64,
    /// Registry contract address to read logs from.
    pub contract_address: String,
    /// Number of blocks behind the head treated as not-yet-final.
    /// A head at height H makes heights ≤ H − depth eligible; deeper
    /// reorganizations are explicitly not handled.
    pub reorg_safety_depth: u64,
    /// Maximum number of blocks per log query, bounding query cost during
    /// cold sync or after a long stall.
    pub max_batch_size: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            contract_address: String::new(),
            reorg_safety_depth: 1,
            max_batch_size: 500,
        }
    }
}
