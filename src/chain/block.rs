//! Block and transaction primitives.
//!
//! A transaction is an opaque JSON object; the only attribute the node
//! interprets is `transactionId` (the stable key used to finalize temporary
//! transactions). Blocks chain by SHA-256:
//!
//! ```text
//! hash = SHA256_hex( prevHash || dec(nonce) || merkleRoot(transactions) )
//! ```
//!
//! The genesis block (index 0) is synthesized with an empty `prevHash` and a
//! fixed root-hash constant instead of a computed merkle root.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::merkle::merkle_root;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Root hash of the genesis block. A literal constant, not a computed
/// merkle root: the genesis block carries no transactions.
pub const GENESIS_ROOT_HASH: &str =
    "1183f7f0cb6243e92d5e4ba2fb626b02bca27ffe89c77dcbd7003167405da253";

/// Required hash prefix for blocks sealed under proof-of-work.
pub const POW_PREFIX: &str = "0000";

/// Attribute holding a transaction's stable identity.
pub const TRANSACTION_ID: &str = "transactionId";

/// Internal annotation marking a transaction as temporary. Holds the
/// wall-clock milliseconds at which the transaction was accepted; removed
/// when a matching `commitTransaction` is committed.
pub const TEMP_MARKER: &str = "@temp";

// ============================================================================
// TRANSACTION
// ============================================================================

/// Client-supplied JSON object. Attribute order is preserved end to end.
pub type Transaction = serde_json::Map<String, Value>;

pub fn transaction_id(tx: &Transaction) -> Option<&str> {
    tx.get(TRANSACTION_ID).and_then(Value::as_str)
}

pub fn is_temporary(tx: &Transaction) -> bool {
    tx.contains_key(TEMP_MARKER)
}

// ============================================================================
// BLOCK
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub version: String,
    /// 0 for genesis; peers may transmit this as a decimal string.
    #[serde(with = "crate::message::index_serde")]
    pub index: u64,
    /// Milliseconds since epoch at sealing time.
    pub timestamp: u64,
    pub nonce: u64,
    /// Hex hash of the predecessor; empty for genesis.
    pub prev_hash: String,
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The root hash this block must commit to: the genesis constant for
    /// index 0, the merkle root of its transactions otherwise.
    pub fn expected_root_hash(&self) -> String {
        if self.index == 0 {
            GENESIS_ROOT_HASH.to_string()
        } else {
            merkle_root(&self.transactions)
        }
    }

    /// Recompute the chained hash and compare it to the stored one.
    pub fn verify_hash(&self) -> bool {
        self.hash == block_hash(&self.prev_hash, self.nonce, &self.expected_root_hash())
    }
}

// ============================================================================
// HASHING
// ============================================================================

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The chained block hash. The nonce enters as its ASCII decimal form, so
/// the same preimage is reproducible from the wire representation.
pub fn block_hash(prev_hash: &str, nonce: u64, root_hash: &str) -> String {
    sha256_hex(format!("{}{}{}", prev_hash, nonce, root_hash).as_bytes())
}

/// Smallest nonce whose block hash carries the proof-of-work prefix.
/// With a four-hex-digit target this terminates after ~65k hashes.
pub fn find_pow_nonce(prev_hash: &str, root_hash: &str) -> u64 {
    let mut nonce = 0u64;
    loop {
        if block_hash(prev_hash, nonce, root_hash).starts_with(POW_PREFIX) {
            return nonce;
        }
        nonce += 1;
    }
}

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

// ============================================================================
// TESTS
// ============================================================================
