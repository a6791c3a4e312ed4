//! Canonical database state hashing.
//!
//! Produces a single SHA-256 digest over the user-visible schema and
//! contents of a database so that independently-ingesting replicas can be
//! compared with one string. Determinism rules:
//!
//! - tables are visited in the order the discovery query returns them
//!   (name-sorted by default), system and internal tables excluded
//! - each table contributes its name bytes, then its schema definition
//!   bytes, then every row's column values in query order
//! - `NULL` contributes nothing; integers and reals contribute their
//!   decimal text; text and blobs contribute their raw bytes
//!
//! Two databases that went through the same mutation history hash
//! identically regardless of when or where they were built.

use rusqlite::{types::ValueRef, Connection};
use sha2::{Digest, Sha256};

use chainsql_core::error::StoreError;

/// Default table discovery: every user table, name-ordered, skipping
/// SQLite internals and the store's own system tables.
pub const DEFAULT_DISCOVERY_QUERY: &str = "SELECT name, sql FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'system_%' \
     ORDER BY name";

/// Controls which tables and which rows feed the digest.
pub struct StateHashConfig {
    /// Must yield `(name, sql)` rows; see [`DEFAULT_DISCOVERY_QUERY`].
    pub schema_discovery_query: String,
    /// Builds the per-table content query from a table name.
    pub per_table_query: fn(&str) -> String,
}

impl Default for StateHashConfig {
    fn default() -> Self {
        Self {
            schema_discovery_query: DEFAULT_DISCOVERY_QUERY.to_string(),
            per_table_query: default_table_query,
        }
    }
}

fn default_table_query(table: &str) -> String {
    format!("SELECT * FROM \"{table}\"")
}

/// Compute the canonical state digest, lowercase hex encoded.
pub fn database_state_hash(
    conn: &Connection,
    config: &StateHashConfig,
) -> Result<String, StoreError> {
    let tables = discover_tables(conn, &config.schema_discovery_query)?;

    let mut hasher = Sha256::new();
    for (name, definition) in &tables {
        hasher.update(name.as_bytes());
        if let Some(sql) = definition {
            hasher.update(sql.as_bytes());
        }
        hash_table_contents(conn, &(config.per_table_query)(name), &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn discover_tables(
    conn: &Connection,
    query: &str,
) -> Result<Vec<(String, Option<String>)>, StoreError> {
    let mut stmt = conn.prepare(query).map_err(hash_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })
        .map_err(hash_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(hash_err)
}

fn hash_table_contents(
    conn: &Connection,
    query: &str,
    hasher: &mut Sha256,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(query).map_err(hash_err)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([]).map_err(hash_err)?;
    while let Some(row) = rows.next().map_err(hash_err)? {
        for i in 0..column_count {
            match row.get_ref(i).map_err(hash_err)? {
                ValueRef::Null => {}
                ValueRef::Integer(v) => hasher.update(v.to_string().as_bytes()),
                ValueRef::Real(v) => hasher.update(v.to_string().as_bytes()),
                ValueRef::Text(bytes) => hasher.update(bytes),
                ValueRef::Blob(bytes) => hasher.update(bytes),
            }
        }
    }
    Ok(())
}

fn hash_err(e: rusqlite::Error) -> StoreError {
    StoreError::Storage(format!("state hash query failed: {e}"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
