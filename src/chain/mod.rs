//! Blockchain engine: the pending-transaction pool and every way a block
//! can come into existence.
//!
//! The engine owns the pool and talks to the block store; it knows nothing
//! about consensus. Raft mode seals with `commit_block` (nonce 0), the
//! proof-of-work variant goes through `proof_of_work` / `commit_proof_of_work`,
//! and peer catch-up lands through `set_blocks` which validates the whole
//! batch before anything is written.
//!
//! All methods are called from the node's single event loop, so pool reads
//! and the read-modify-write against the store are never interleaved.

pub mod block;
pub mod merkle;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::store::BlockStore;

pub use block::{Block, Transaction};
use block::{
    block_hash, find_pow_nonce, is_temporary, now_millis, transaction_id, GENESIS_ROOT_HASH,
    POW_PREFIX, TEMP_MARKER,
};
use merkle::merkle_root;

// ============================================================================
// PROOF-OF-WORK CANDIDATE
// ============================================================================

/// A mined-but-unsealed block: everything a node needs to seal the next
/// block, without touching the pool yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowCandidate {
    #[serde(with = "crate::message::index_serde")]
    pub index: u64,
    pub root_hash: String,
    pub nonce: u64,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct BlockchainEngine {
    version: String,
    store: Arc<BlockStore>,
    /// Pending transactions in arrival order. Temporary entries (those
    /// carrying the `@temp` annotation) stay here until finalized and are
    /// never drained into a block.
    pool: Vec<Transaction>,
}

impl BlockchainEngine {
    pub fn new(version: String, store: Arc<BlockStore>) -> Self {
        Self {
            version,
            store,
            pool: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    fn confirmed(&self) -> Vec<Transaction> {
        self.pool
            .iter()
            .filter(|t| !is_temporary(t))
            .cloned()
            .collect()
    }

    pub fn confirmed_count(&self) -> usize {
        self.pool.iter().filter(|t| !is_temporary(t)).count()
    }

    // ========================================================================
    // POOL OPERATIONS
    // ========================================================================

    /// Queue a transaction for the next block. In temporary mode the
    /// transaction is annotated with the acceptance timestamp and held back
    /// until a matching `commit_transaction` arrives.
    pub fn add_transaction(&mut self, mut tx: Transaction, temporary: bool) {
        if temporary {
            tx.insert(TEMP_MARKER.to_string(), now_millis().into());
        }
        self.pool.push(tx);
    }

    /// Finalize the temporary transaction with the given id: the `@temp`
    /// annotation is removed and the transaction becomes eligible for the
    /// next block. Returns false when no matching temporary entry exists.
    pub fn commit_transaction(&mut self, id: &str) -> bool {
        for tx in self.pool.iter_mut() {
            if is_temporary(tx) && transaction_id(tx) == Some(id) {
                tx.remove(TEMP_MARKER);
                return true;
            }
        }
        debug!(transaction_id = %id, "commitTransaction with no matching temporary entry");
        false
    }

    /// Remove the given transactions from the pool after a successful seal.
    fn drain_confirmed(&mut self) {
        self.pool.retain(is_temporary);
    }

    // ========================================================================
    // SEALING
    // ========================================================================

    /// Seal the confirmed pool into the next block (consensus mode: the
    /// nonce is fixed at zero). The pool is only drained once the block has
    /// been persisted.
    pub fn commit_block(&mut self) -> Result<Block> {
        let transactions = self.confirmed();
        if transactions.is_empty() {
            return Err(NodeError::validation("transaction pool is empty"));
        }
        let last = self.last_block_required()?;
        let root_hash = merkle_root(&transactions);
        let block = Block {
            version: self.version.clone(),
            index: last.index + 1,
            timestamp: now_millis(),
            nonce: 0,
            prev_hash: last.hash.clone(),
            hash: block_hash(&last.hash, 0, &root_hash),
            transactions,
        };
        self.store.put_block(&block)?;
        self.drain_confirmed();
        Ok(block)
    }

    /// Mine a candidate for the next block over the current confirmed pool.
    /// Pure read: neither the pool nor the store is modified.
    pub fn proof_of_work(&self) -> Result<PowCandidate> {
        let transactions = self.confirmed();
        if transactions.is_empty() {
            return Err(NodeError::validation("transaction pool is empty"));
        }
        let last = self.last_block_required()?;
        let root_hash = merkle_root(&transactions);
        let nonce = find_pow_nonce(&last.hash, &root_hash);
        Ok(PowCandidate {
            index: last.index + 1,
            root_hash,
            nonce,
        })
    }

    /// Seal a mined candidate. A candidate for an already-sealed index is a
    /// silent no-op (every node in the cluster races to commit the same
    /// candidate); a root-hash or difficulty mismatch is a recoverable
    /// validation error.
    pub fn commit_proof_of_work(
        &mut self,
        index: u64,
        root_hash: &str,
        nonce: u64,
    ) -> Result<Option<Block>> {
        let last = self.last_block_required()?;
        if index <= last.index {
            return Ok(None);
        }
        if index != last.index + 1 {
            return Err(NodeError::validation(format!(
                "proof of work for block {} but chain head is {}",
                index, last.index
            )));
        }
        let transactions = self.confirmed();
        if transactions.is_empty() {
            return Err(NodeError::validation("transaction pool is empty"));
        }
        if merkle_root(&transactions) != root_hash {
            return Err(NodeError::validation(
                "candidate root hash does not match the local pool",
            ));
        }
        let hash = block_hash(&last.hash, nonce, root_hash);
        if !hash.starts_with(POW_PREFIX) {
            return Err(NodeError::validation("hash does not satisfy the difficulty"));
        }
        let block = Block {
            version: self.version.clone(),
            index,
            timestamp: now_millis(),
            nonce,
            prev_hash: last.hash.clone(),
            hash,
            transactions,
        };
        self.store.put_block(&block)?;
        self.drain_confirmed();
        Ok(Some(block))
    }

    /// Synthesize the genesis block. Under proof-of-work the genesis nonce
    /// is mined like any other block's.
    pub fn genesis_block(&self, proof_of_work: bool) -> Block {
        let nonce = if proof_of_work {
            find_pow_nonce("", GENESIS_ROOT_HASH)
        } else {
            0
        };
        Block {
            version: self.version.clone(),
            index: 0,
            timestamp: now_millis(),
            nonce,
            prev_hash: String::new(),
            hash: block_hash("", nonce, GENESIS_ROOT_HASH),
            transactions: vec![],
        }
    }

    // ========================================================================
    // CHAIN VALIDATION
    // ========================================================================

    /// Validate and append a batch of incoming blocks. Blocks at or below
    /// the current head are dropped; the remainder must extend the chain
    /// contiguously and verify hash by hash. All-or-nothing: any failure
    /// leaves the store untouched. Returns the blocks actually appended.
    pub fn set_blocks(&mut self, blocks: Vec<Block>) -> Result<Vec<Block>> {
        let last = self.store.last_block()?;
        let (mut expected_index, mut prev_hash) = match &last {
            Some(head) => (head.index + 1, head.hash.clone()),
            None => (0, String::new()),
        };

        let incoming: Vec<Block> = blocks
            .into_iter()
            .filter(|b| last.as_ref().map_or(true, |head| b.index > head.index))
            .collect();
        if incoming.is_empty() {
            return Ok(vec![]);
        }

        for block in &incoming {
            if block.index != expected_index {
                return Err(NodeError::validation(format!(
                    "block {} breaks continuity (expected index {})",
                    block.index, expected_index
                )));
            }
            if block.index == 0 && !block.transactions.is_empty() {
                return Err(NodeError::validation("genesis block must carry no transactions"));
            }
            if block.index > 0 && block.transactions.is_empty() {
                return Err(NodeError::validation(format!(
                    "block {} carries no transactions",
                    block.index
                )));
            }
            if block.prev_hash != prev_hash {
                return Err(NodeError::validation(format!(
                    "block {} does not link to its predecessor",
                    block.index
                )));
            }
            if !block.verify_hash() {
                return Err(NodeError::validation(format!(
                    "block {} fails hash verification",
                    block.index
                )));
            }
            expected_index += 1;
            prev_hash = block.hash.clone();
        }

        self.store.put_blocks(&incoming)?;
        Ok(incoming)
    }

    fn last_block_required(&self) -> Result<Block> {
        self.store
            .last_block()?
            .ok_or_else(|| NodeError::validation("chain has no genesis block yet"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
