//! Block query evaluation (`restoreBlocks`).
//!
//! A query walks the primary keyspace in either direction, filters each
//! block by timestamp bounds and transaction conditions, and emits blocks
//! reduced to their surviving transactions (or bare header summaries).
//! Genesis never appears in query output.
//!
//! Conditions arrive as loosely-shaped JSON and are normalized into a typed
//! algebra before evaluation:
//!
//! - `Equality` / `Substring`: attribute predicates over the condition's
//!   own keys, combined with `or` (default) or `and`
//! - `Between`: per-key inclusive range predicates; keys with a missing or
//!   inverted `{begin, end}` pair are silently dropped
//!
//! An *array* of conditions is applied as successive AND stages over the
//! transactions.
//!
//! When every key mentioned by every condition has a secondary index and no
//! condition is a range, candidate blocks are resolved through the indexes
//! instead of scanning, then re-filtered in memory in direction order.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::block::Transaction;
use crate::chain::Block;
use crate::error::{NodeError, Result};

use super::{stringify_value, BlockStore, BLOCKS};

// ============================================================================
// QUERY SHAPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    #[default]
    Backward,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockQuery {
    #[serde(default)]
    pub direction: Direction,
    /// Matching blocks to skip before emitting.
    #[serde(default)]
    pub offset: u64,
    /// Maximum blocks to emit; absent means unbounded.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Inclusive bounds on the block timestamp; either side may be open.
    #[serde(default)]
    pub timestamp_start: Option<u64>,
    #[serde(default)]
    pub timestamp_end: Option<u64>,
    /// Emit `{index, timestamp, transactionCount}` instead of full blocks.
    #[serde(default)]
    pub header_only: bool,
    /// One condition object or an ordered array of them; parsed lazily so a
    /// malformed condition is a query-time validation error.
    #[serde(default)]
    pub transaction_condition: Option<Value>,
}

impl BlockQuery {
    /// True when this is a bare ascending chain dump, the node-bootstrap
    /// sync shape, which must reproduce the store bit for bit (genesis
    /// included) rather than obey query-output rules.
    pub fn is_chain_sync(&self) -> bool {
        self.direction == Direction::Forward
            && self.offset == 0
            && self.limit.is_none()
            && self.timestamp_start.is_none()
            && self.timestamp_end.is_none()
            && !self.header_only
            && self.transaction_condition.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeaderSummary {
    pub index: u64,
    pub timestamp: u64,
    pub transaction_count: usize,
}

/// One emitted result: a block reduced to its surviving transactions, or a
/// header summary under `headerOnly`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryHit {
    Block(Block),
    Header(BlockHeaderSummary),
}

impl QueryHit {
    pub fn index(&self) -> u64 {
        match self {
            QueryHit::Block(b) => b.index,
            QueryHit::Header(h) => h.index,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            QueryHit::Block(b) => Some(b),
            QueryHit::Header(_) => None,
        }
    }
}

// ============================================================================
// CONDITION ALGEBRA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equality {
        combine: Combine,
        terms: Vec<(String, Value)>,
    },
    Substring {
        combine: Combine,
        terms: Vec<(String, String)>,
    },
    Between {
        ranges: Vec<(String, Value, Value)>,
    },
}

impl Condition {
    /// Normalize one raw condition object.
    pub fn parse(raw: &Value) -> Result<Condition> {
        let obj = raw
            .as_object()
            .ok_or_else(|| NodeError::validation("transaction condition must be an object"))?;
        let operation = obj
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("or");
        let ambiguous = obj
            .get("ambiguous")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let conditions = obj
            .get("conditions")
            .and_then(Value::as_object)
            .ok_or_else(|| NodeError::validation("transaction condition has no conditions map"))?;

        match operation {
            "between" => {
                let mut ranges = Vec::new();
                for (key, bounds) in conditions {
                    let Some(bounds) = bounds.as_object() else {
                        continue;
                    };
                    let (Some(begin), Some(end)) = (bounds.get("begin"), bounds.get("end")) else {
                        continue;
                    };
                    // Inverted or incomparable bounds are dropped, not errors.
                    match value_cmp(begin, end) {
                        Some(Ordering::Less) | Some(Ordering::Equal) => {
                            ranges.push((key.clone(), begin.clone(), end.clone()));
                        }
                        _ => {}
                    }
                }
                Ok(Condition::Between { ranges })
            }
            "and" | "or" => {
                let combine = if operation == "and" {
                    Combine::And
                } else {
                    Combine::Or
                };
                if ambiguous {
                    Ok(Condition::Substring {
                        combine,
                        terms: conditions
                            .iter()
                            .map(|(k, v)| (k.clone(), stringify_value(v)))
                            .collect(),
                    })
                } else {
                    Ok(Condition::Equality {
                        combine,
                        terms: conditions
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    })
                }
            }
            other => Err(NodeError::validation(format!(
                "unknown condition operation \"{}\"",
                other
            ))),
        }
    }

    /// Normalize the `transactionCondition` field: a single object or an
    /// ordered array of them.
    pub fn parse_all(raw: &Value) -> Result<Vec<Condition>> {
        match raw {
            Value::Array(items) => items.iter().map(Condition::parse).collect(),
            Value::Object(_) => Ok(vec![Condition::parse(raw)?]),
            _ => Err(NodeError::validation(
                "transactionCondition must be an object or an array",
            )),
        }
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        match self {
            Condition::Equality { combine, terms } => {
                evaluate(*combine, terms, |(key, value)| {
                    tx.get(key.as_str()) == Some(value)
                })
            }
            Condition::Substring { combine, terms } => {
                evaluate(*combine, terms, |(key, needle)| {
                    tx.get(key.as_str())
                        .map_or(false, |v| stringify_value(v).contains(needle.as_str()))
                })
            }
            Condition::Between { ranges } => ranges.iter().all(|(key, begin, end)| {
                tx.get(key.as_str())
                    .map_or(false, |v| within(v, begin, end))
            }),
        }
    }

    fn keys(&self) -> Vec<&str> {
        match self {
            Condition::Equality { terms, .. } => terms.iter().map(|(k, _)| k.as_str()).collect(),
            Condition::Substring { terms, .. } => terms.iter().map(|(k, _)| k.as_str()).collect(),
            Condition::Between { ranges } => ranges.iter().map(|(k, _, _)| k.as_str()).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

/// A condition with no keys filters nothing.
fn evaluate<T>(combine: Combine, terms: &[T], pred: impl Fn(&T) -> bool) -> bool {
    if terms.is_empty() {
        return true;
    }
    match combine {
        Combine::And => terms.iter().all(pred),
        Combine::Or => terms.iter().any(pred),
    }
}

/// Partial order over JSON scalars: numbers compare numerically, strings
/// lexically, everything else is incomparable.
fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn within(value: &Value, begin: &Value, end: &Value) -> bool {
    matches!(
        value_cmp(value, begin),
        Some(Ordering::Greater) | Some(Ordering::Equal)
    ) && matches!(
        value_cmp(value, end),
        Some(Ordering::Less) | Some(Ordering::Equal)
    )
}

// ============================================================================
// EVALUATION
// ============================================================================

impl BlockStore {
    /// Evaluate a block query. See the module docs for semantics.
    pub fn restore_blocks(&self, query: &BlockQuery) -> Result<Vec<QueryHit>> {
        let conditions = match &query.transaction_condition {
            Some(raw) => Condition::parse_all(raw)?,
            None => Vec::new(),
        };
        if self.index_assisted_eligible(&conditions) {
            self.query_by_index(query, &conditions)
        } else {
            self.query_by_scan(query, &conditions)
        }
    }

    /// The fast path applies when every mentioned key is indexed, no
    /// condition is a range, and no condition is degenerate (keyless).
    fn index_assisted_eligible(&self, conditions: &[Condition]) -> bool {
        !conditions.is_empty()
            && conditions.iter().all(|c| {
                !matches!(c, Condition::Between { .. })
                    && !c.is_empty()
                    && c.keys()
                        .iter()
                        .all(|k| self.index_keys().iter().any(|ik| ik == k))
            })
    }

    fn query_by_scan(&self, query: &BlockQuery, conditions: &[Condition]) -> Result<Vec<QueryHit>> {
        let rtx = self.db.begin_read().map_err(NodeError::storage)?;
        let table = rtx.open_table(BLOCKS).map_err(NodeError::storage)?;
        let range = table.iter().map_err(NodeError::storage)?;
        match query.direction {
            Direction::Forward => collect_hits(range, query, conditions),
            Direction::Backward => collect_hits(range.rev(), query, conditions),
        }
    }

    fn query_by_index(
        &self,
        query: &BlockQuery,
        conditions: &[Condition],
    ) -> Result<Vec<QueryHit>> {
        let mut candidates: Option<BTreeSet<u64>> = None;
        for condition in conditions {
            let set = self.condition_candidates(condition)?;
            candidates = Some(match candidates {
                None => set,
                Some(prev) => prev.intersection(&set).copied().collect(),
            });
        }
        let mut ordered: Vec<u64> = candidates.unwrap_or_default().into_iter().collect();
        if query.direction == Direction::Backward {
            ordered.reverse();
        }

        let mut hits = Vec::new();
        let mut matched = 0u64;
        for index in ordered {
            if index == 0 {
                continue;
            }
            let Some(block) = self.get_block(index)? else {
                continue;
            };
            let Some(hit) = filter_block(block, query, conditions) else {
                continue;
            };
            matched += 1;
            if matched <= query.offset {
                continue;
            }
            hits.push(hit);
            if query.limit.map_or(false, |l| hits.len() as u64 >= l) {
                break;
            }
        }
        Ok(hits)
    }

    /// Candidate block indexes for one condition, resolved purely through
    /// the secondary indexes. A superset per block: the exact predicate is
    /// re-applied transaction by transaction afterwards.
    fn condition_candidates(&self, condition: &Condition) -> Result<BTreeSet<u64>> {
        match condition {
            Condition::Equality { combine, terms } => {
                let mut per_term = Vec::with_capacity(terms.len());
                for (key, value) in terms {
                    let ids = self.index_lookup(key, &stringify_value(value))?;
                    per_term.push(ids.into_iter().collect::<BTreeSet<u64>>());
                }
                Ok(combine_sets(*combine, per_term))
            }
            Condition::Substring { combine, terms } => {
                let mut per_term = Vec::with_capacity(terms.len());
                for (key, needle) in terms {
                    let mut ids = BTreeSet::new();
                    for (value, blocks) in self.index_entries(key)? {
                        if value.contains(needle.as_str()) {
                            ids.extend(blocks);
                        }
                    }
                    per_term.push(ids);
                }
                Ok(combine_sets(*combine, per_term))
            }
            Condition::Between { .. } => Err(NodeError::validation(
                "range conditions cannot be index-assisted",
            )),
        }
    }
}

fn combine_sets(combine: Combine, sets: Vec<BTreeSet<u64>>) -> BTreeSet<u64> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return BTreeSet::new();
    };
    match combine {
        Combine::Or => iter.fold(first, |mut acc, s| {
            acc.extend(s);
            acc
        }),
        Combine::And => iter.fold(first, |acc, s| acc.intersection(&s).copied().collect()),
    }
}

fn collect_hits<'a, I>(
    entries: I,
    query: &BlockQuery,
    conditions: &[Condition],
) -> Result<Vec<QueryHit>>
where
    I: Iterator<
        Item = std::result::Result<
            (redb::AccessGuard<'a, u64>, redb::AccessGuard<'a, &'static [u8]>),
            redb::StorageError,
        >,
    >,
{
    let mut hits = Vec::new();
    let mut matched = 0u64;
    for entry in entries {
        let (key, value) = entry.map_err(NodeError::storage)?;
        if key.value() == 0 {
            continue;
        }
        let block: Block = serde_json::from_slice(value.value())?;
        let Some(hit) = filter_block(block, query, conditions) else {
            continue;
        };
        matched += 1;
        if matched <= query.offset {
            continue;
        }
        hits.push(hit);
        if query.limit.map_or(false, |l| hits.len() as u64 >= l) {
            break;
        }
    }
    Ok(hits)
}

/// Apply timestamp bounds and the condition stages to one block. `None`
/// means the block is skipped entirely.
fn filter_block(block: Block, query: &BlockQuery, conditions: &[Condition]) -> Option<QueryHit> {
    if query.timestamp_start.map_or(false, |s| block.timestamp < s) {
        return None;
    }
    if query.timestamp_end.map_or(false, |e| block.timestamp > e) {
        return None;
    }

    let surviving: Vec<Transaction> = if conditions.is_empty() {
        block.transactions.clone()
    } else {
        block
            .transactions
            .iter()
            .filter(|tx| conditions.iter().all(|c| c.matches(tx)))
            .cloned()
            .collect()
    };
    if surviving.is_empty() && !conditions.is_empty() {
        return None;
    }

    if query.header_only {
        Some(QueryHit::Header(BlockHeaderSummary {
            index: block.index,
            timestamp: block.timestamp,
            transaction_count: surviving.len(),
        }))
    } else {
        Some(QueryHit::Block(Block {
            transactions: surviving,
            ..block
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================
