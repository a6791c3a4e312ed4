//! The finite set of contract events ChainSQL materializes.
//!
//! Events are decoded exactly once, at the feed boundary, from a raw log
//! plus its ABI descriptor. Downstream code matches exhaustively over
//! [`TableEvent`]; a log whose `topics[0]` is not in the registry is a fatal
//! decode error, never a silent drop.

use tiny_keccak::{Hasher, Keccak};

/// A decoded registry-contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// A SQL mutation submitted through the registry contract.
    RunSql {
        /// Address that submitted the statement.
        caller: String,
        /// Identifier of the target table.
        table_id: u64,
        /// The embedded SQL statement, unvalidated.
        statement: String,
    },
    /// Ownership transfer of a table.
    TransferTable {
        from: String,
        to: String,
        table_id: u64,
    },
}

impl TableEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunSql { .. } => EventKind::RunSql,
            Self::TransferTable { .. } => EventKind::TransferTable,
        }
    }
}

/// Discriminant of [`TableEvent`], used for topic filtering and registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunSql,
    TransferTable,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::RunSql, EventKind::TransferTable];

    /// Canonical ABI signature string for this event.
    pub fn signature(&self) -> &'static str {
        match self {
            Self::RunSql => "RunSQL(address,uint256,string)",
            Self::TransferTable => "TransferTable(address,address,uint256)",
        }
    }

    /// `topics[0]` value for this event: keccak256 of the signature,
    /// lowercase hex with a `0x` prefix.
    pub fn topic0(&self) -> String {
        let mut hasher = Keccak::v256();
        let mut output = [0u8; 32];
        hasher.update(self.signature().as_bytes());
        hasher.finalize(&mut output);
        format!("0x{}", hex::encode(output))
    }
}
