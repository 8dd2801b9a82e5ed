//! Indexed block store.
//!
//! Backed by redb: one ACID file per node with two typed tables.
//!
//! - `"main"`: the primary keyspace, block index (`u64`, stored big-endian
//!   by redb) to the block's JSON bytes; ordered iteration both ways
//! - `"indexes"`: every secondary index folded into one composite-key
//!   table, `(indexKey, stringified value)` to a sorted JSON list of block
//!   indexes containing a matching transaction
//!
//! A block put and all of its index updates share a single write
//! transaction, so readers never observe a block without its index entries.
//! The set of indexed attributes is fixed at store construction.

pub mod query;

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tracing::info;

use crate::chain::Block;
use crate::error::{NodeError, Result};

const BLOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("main");
const INDEXES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("indexes");

/// How an attribute value is keyed in the secondary index: strings as-is,
/// everything else in its compact JSON form (`3`, `true`, `null`).
pub(crate) fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// BLOCK STORE
// ============================================================================

pub struct BlockStore {
    db: Database,
    index_keys: Vec<String>,
}

impl BlockStore {
    /// Open (or create) the store under the given directory.
    pub fn open(dir: &Path, index_keys: Vec<String>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| NodeError::Storage(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join("ledger.redb");
        let db = Database::create(&path).map_err(NodeError::storage)?;

        // Make sure both tables exist before the first read transaction.
        let init = db.begin_write().map_err(NodeError::storage)?;
        {
            init.open_table(BLOCKS).map_err(NodeError::storage)?;
            init.open_table(INDEXES).map_err(NodeError::storage)?;
        }
        init.commit().map_err(NodeError::storage)?;

        info!(path = %path.display(), index_keys = ?index_keys, "block store opened");
        Ok(Self { db, index_keys })
    }

    pub fn index_keys(&self) -> &[String] {
        &self.index_keys
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub fn put_block(&self, block: &Block) -> Result<()> {
        self.put_blocks(std::slice::from_ref(block))
    }

    /// Append blocks and update every applicable secondary index in one
    /// transaction.
    pub fn put_blocks(&self, blocks: &[Block]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let wtx = self.db.begin_write().map_err(NodeError::storage)?;
        {
            let mut blocks_table = wtx.open_table(BLOCKS).map_err(NodeError::storage)?;
            let mut index_table = wtx.open_table(INDEXES).map_err(NodeError::storage)?;
            for block in blocks {
                let bytes = serde_json::to_vec(block)?;
                blocks_table
                    .insert(block.index, bytes.as_slice())
                    .map_err(NodeError::storage)?;

                for key in &self.index_keys {
                    for tx in &block.transactions {
                        let Some(value) = tx.get(key.as_str()) else {
                            continue;
                        };
                        let value_str = stringify_value(value);
                        let entry_key = (key.as_str(), value_str.as_str());
                        let mut ids: Vec<u64> = index_table
                            .get(entry_key)
                            .map_err(NodeError::storage)?
                            .map(|guard| serde_json::from_slice(guard.value()))
                            .transpose()?
                            .unwrap_or_default();
                        if let Err(pos) = ids.binary_search(&block.index) {
                            ids.insert(pos, block.index);
                            let encoded = serde_json::to_vec(&ids)?;
                            index_table
                                .insert(entry_key, encoded.as_slice())
                                .map_err(NodeError::storage)?;
                        }
                    }
                }
            }
        }
        wtx.commit().map_err(NodeError::storage)?;
        Ok(())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Fetch one block. A missing index is "none", not an error.
    pub fn get_block(&self, index: u64) -> Result<Option<Block>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(BLOCKS).map_err(NodeError::storage)?;
        table
            .get(index)
            .map_err(NodeError::storage)?
            .map(|guard| serde_json::from_slice(guard.value()).map_err(NodeError::from))
            .transpose()
    }

    pub fn last_block(&self) -> Result<Option<Block>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(BLOCKS).map_err(NodeError::storage)?;
        let result = table
            .last()
            .map_err(NodeError::storage)?
            .map(|(_, guard)| serde_json::from_slice(guard.value()).map_err(NodeError::from))
            .transpose();
        result
    }

    pub fn last_index(&self) -> Result<Option<u64>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(BLOCKS).map_err(NodeError::storage)?;
        let result = table
            .last()
            .map_err(NodeError::storage)?
            .map(|(key, _)| key.value());
        Ok(result)
    }

    /// The whole chain in ascending order, genesis included. This is the
    /// node-bootstrap sync path, not a client query (see [`query`]).
    pub fn dump_chain(&self) -> Result<Vec<Block>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(BLOCKS).map_err(NodeError::storage)?;
        let mut chain = Vec::new();
        for entry in table.iter().map_err(NodeError::storage)? {
            let (_, guard) = entry.map_err(NodeError::storage)?;
            chain.push(serde_json::from_slice(guard.value())?);
        }
        Ok(chain)
    }

    // ========================================================================
    // SECONDARY INDEXES
    // ========================================================================

    /// Block indexes whose transactions carry `key == value`, ascending.
    pub fn index_lookup(&self, key: &str, value: &str) -> Result<Vec<u64>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(INDEXES).map_err(NodeError::storage)?;
        table
            .get((key, value))
            .map_err(NodeError::storage)?
            .map(|guard| serde_json::from_slice(guard.value()).map_err(NodeError::from))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// All `(value, block indexes)` entries recorded for one index key.
    /// Used by substring conditions on the index-assisted path.
    pub fn index_entries(&self, key: &str) -> Result<Vec<(String, Vec<u64>)>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(INDEXES).map_err(NodeError::storage)?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(NodeError::storage)? {
            let (key_guard, value_guard) = entry.map_err(NodeError::storage)?;
            let (entry_key, entry_value) = key_guard.value();
            if entry_key == key {
                entries.push((
                    entry_value.to_string(),
                    serde_json::from_slice(value_guard.value())?,
                ));
            }
        }
        Ok(entries)
    }
}

// ============================================================================
// TESTS
// ============================================================================
