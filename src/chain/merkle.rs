//! Merkle root over a block's transactions.
//!
//! Leaves are SHA-256 digests of each transaction's canonical JSON form.
//! Levels are reduced pairwise over the *hex strings* (the two digests are
//! concatenated as ASCII and rehashed); an odd trailing element is carried
//! through unchanged rather than paired with itself.

use serde_json::Value;

use super::block::{sha256_hex, Transaction};

/// The canonical JSON form of a transaction: compact encoding with the
/// original attribute order, integers in decimal.
pub fn canonical_json(tx: &Transaction) -> String {
    serde_json::to_string(&Value::Object(tx.clone())).unwrap_or_default()
}

pub fn transaction_hash(tx: &Transaction) -> String {
    sha256_hex(canonical_json(tx).as_bytes())
}

/// Merkle root of a non-empty transaction sequence. A single transaction's
/// root is its own leaf hash.
pub fn merkle_root(transactions: &[Transaction]) -> String {
    let mut level: Vec<String> = transactions.iter().map(transaction_hash).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        let mut pairs = level.chunks_exact(2);
        for pair in &mut pairs {
            next.push(sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()));
        }
        if let [odd] = pairs.remainder() {
            next.push(odd.clone());
        }
        level = next;
    }
    level.into_iter().next().unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(n: u64) -> Transaction {
        match json!({ "transactionId": format!("t-{}", n), "n": n }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_single_transaction_root_is_leaf_hash() {
        let t = tx(1);
        assert_eq!(merkle_root(&[t.clone()]), transaction_hash(&t));
    }

    #[test]
    fn test_two_transactions_hash_pairwise() {
        let (a, b) = (tx(1), tx(2));
        let expected = sha256_hex(
            format!("{}{}", transaction_hash(&a), transaction_hash(&b)).as_bytes(),
        );
        assert_eq!(merkle_root(&[a, b]), expected);
    }

    #[test]
    fn test_odd_leaf_carried_through() {
        let (a, b, c) = (tx(1), tx(2), tx(3));
        let ab = sha256_hex(
            format!("{}{}", transaction_hash(&a), transaction_hash(&b)).as_bytes(),
        );
        // Level 1 is [H(ab), h(c)]; c's leaf hash is carried, not duplicated.
        let expected = sha256_hex(format!("{}{}", ab, transaction_hash(&c)).as_bytes());
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_root_depends_on_order() {
        let (a, b) = (tx(1), tx(2));
        assert_ne!(
            merkle_root(&[a.clone(), b.clone()]),
            merkle_root(&[b, a])
        );
    }

    #[test]
    fn test_canonical_json_preserves_attribute_order() {
        let t = match json!({ "zeta": 1, "alpha": 2 }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(canonical_json(&t), r#"{"zeta":1,"alpha":2}"#);
    }
}
