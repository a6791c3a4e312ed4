//! Signature→decoder registry for registry-contract events.
//!
//! `topics[0]` is matched against the keccak256 fingerprints of the known
//! event signatures; the matching decoder turns the log's topics and data
//! into a [`TableEvent`]. Unknown signatures are a fatal decode error —
//! a contract emitting something this registry cannot name means the
//! registry is out of date, and silently dropping it would fork replicas.

use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, DynSolValue};

use chainsql_core::error::DecodeError;
use chainsql_core::event::{EventKind, TableEvent};
use chainsql_core::types::LogEntry;

/// Resolves `topics[0]` to a decode routine for the configured event kinds.
pub struct EventDecoder {
    registry: HashMap<String, EventKind>,
}

impl EventDecoder {
    /// Registry restricted to `kinds`.
    pub fn new(kinds: &[EventKind]) -> Self {
        let registry = kinds
            .iter()
            .map(|kind| (kind.topic0(), *kind))
            .collect();
        Self { registry }
    }

    /// Registry over every known event kind.
    pub fn all() -> Self {
        Self::new(&EventKind::ALL)
    }

    /// The topic0 values to restrict log queries to.
    pub fn topic0_filter(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Decode a raw log into a typed event.
    pub fn decode(&self, log: &LogEntry) -> Result<TableEvent, DecodeError> {
        let topic0 = log
            .topics
            .first()
            .ok_or_else(|| DecodeError::UnknownSignature {
                topic0: "<no topics>".into(),
            })?;
        let kind = self
            .registry
            .get(&topic0.to_ascii_lowercase())
            .ok_or_else(|| DecodeError::UnknownSignature {
                topic0: topic0.clone(),
            })?;
        match kind {
            EventKind::RunSql => decode_run_sql(log),
            EventKind::TransferTable => decode_transfer_table(log),
        }
    }
}

/// `RunSQL(address caller, uint256 tableId, string statement)` — all
/// non-indexed, carried in the data payload.
fn decode_run_sql(log: &LogEntry) -> Result<TableEvent, DecodeError> {
    let ty = DynSolType::Tuple(vec![
        DynSolType::Address,
        DynSolType::Uint(256),
        DynSolType::String,
    ]);
    let mut fields = decode_data(&ty, &log.data)?.into_iter();
    let caller = as_address(fields.next())?;
    let table_id = as_u64(fields.next())?;
    let statement = as_string(fields.next())?;
    Ok(TableEvent::RunSql {
        caller,
        table_id,
        statement,
    })
}

/// `TransferTable(address indexed from, address indexed to, uint256 tableId)`
/// — the addresses sit in `topics[1..=2]`, the table id in the data.
fn decode_transfer_table(log: &LogEntry) -> Result<TableEvent, DecodeError> {
    let from = topic_address(log.topics.get(1))?;
    let to = topic_address(log.topics.get(2))?;
    let ty = DynSolType::Tuple(vec![DynSolType::Uint(256)]);
    let mut fields = decode_data(&ty, &log.data)?.into_iter();
    let table_id = as_u64(fields.next())?;
    Ok(TableEvent::TransferTable { from, to, table_id })
}

fn decode_data(ty: &DynSolType, data: &[u8]) -> Result<Vec<DynSolValue>, DecodeError> {
    let decoded = ty.abi_decode_params(data).map_err(|e| DecodeError::Abi {
        reason: e.to_string(),
    })?;
    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

fn as_address(value: Option<DynSolValue>) -> Result<String, DecodeError> {
    match value {
        Some(DynSolValue::Address(addr)) => Ok(format!("0x{}", hex::encode(addr.as_slice()))),
        other => Err(abi_mismatch("address", &other)),
    }
}

fn as_u64(value: Option<DynSolValue>) -> Result<u64, DecodeError> {
    match value {
        Some(DynSolValue::Uint(v, _)) => u64::try_from(v).map_err(|_| DecodeError::Abi {
            reason: "table id out of u64 range".into(),
        }),
        other => Err(abi_mismatch("uint256", &other)),
    }
}

fn as_string(value: Option<DynSolValue>) -> Result<String, DecodeError> {
    match value {
        Some(DynSolValue::String(s)) => Ok(s),
        other => Err(abi_mismatch("string", &other)),
    }
}

fn abi_mismatch(expected: &str, got: &Option<DynSolValue>) -> DecodeError {
    DecodeError::Abi {
        reason: format!("expected {expected}, got {got:?}"),
    }
}

/// An indexed address topic: 32 bytes, address in the last 20.
fn topic_address(topic: Option<&String>) -> Result<String, DecodeError> {
    let topic = topic.ok_or_else(|| DecodeError::Abi {
        reason: "missing indexed address topic".into(),
    })?;
    let raw = hex::decode(topic.strip_prefix("0x").unwrap_or(topic)).map_err(|e| {
        DecodeError::Abi {
            reason: format!("invalid topic hex: {e}"),
        }
    })?;
    if raw.len() != 32 {
        return Err(DecodeError::Abi {
            reason: format!("topic is {} bytes, expected 32", raw.len()),
        });
    }
    Ok(format!("0x{}", hex::encode(&raw[12..])))
}
