//! Consensus engines.
//!
//! The algorithm is chosen by name at startup and never changes for the
//! lifetime of the node, so the two engines live behind a plain enum rather
//! than a trait object. Both speak the same envelope vocabulary; commands
//! or pushes that don't apply to the active engine are ignored, like any
//! other unknown message.

pub mod pow;
pub mod raft;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::chain::block::Transaction;
use crate::config::{ConsensusAlgorithm, NodeConfig};
use crate::node::{NodeCtx, ReplySink};

pub use pow::PowEngine;
pub use raft::{RaftEngine, Role};

// ============================================================================
// REPLICATED ENTRY KINDS
// ============================================================================

/// What a provisional entry carries: plain transactions, temporary
/// transactions, or the ids of temporary transactions to finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Normal,
    Temporary,
    Commit,
}

impl EntryKind {
    /// The data-push name used when a non-leader forwards this payload.
    pub fn forward_name(self) -> &'static str {
        match self {
            EntryKind::Normal => "transaction",
            EntryKind::Temporary => "temporaryTransaction",
            EntryKind::Commit => "committedTransaction",
        }
    }
}

/// Client payloads accept one transaction or a batch.
pub(crate) fn payload_transactions(payload: &Value) -> Vec<Transaction> {
    match payload {
        Value::Object(map) => vec![map.clone()],
        Value::Array(items) => items.iter().filter_map(|v| v.as_object().cloned()).collect(),
        _ => vec![],
    }
}

/// `commitTransaction` payloads accept one id or a batch of ids.
pub(crate) fn payload_ids(payload: &Value) -> Vec<String> {
    match payload {
        Value::String(id) => vec![id.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => vec![],
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

pub enum Consensus {
    Raft(RaftEngine),
    Pow(PowEngine),
}

impl Consensus {
    pub fn from_config(config: &NodeConfig) -> Self {
        match config.consensus_algorithm {
            ConsensusAlgorithm::Raft => Consensus::Raft(RaftEngine::new()),
            ConsensusAlgorithm::PoW => Consensus::Pow(PowEngine::new()),
        }
    }

    /// How long until the engine's single logical timer fires next. Leaders
    /// tick at the keepalive cadence; everyone else draws a fresh election
    /// timeout; the proof-of-work miner runs at its own fixed interval.
    pub fn timer_interval(&self, config: &NodeConfig) -> Duration {
        let millis = match self {
            Consensus::Raft(raft) if raft.role() == Role::Leader => config.keepalive_interval,
            Consensus::Raft(_) => rand::thread_rng()
                .gen_range(config.election_min_interval..config.election_max_interval),
            Consensus::Pow(_) => config.consensus_interval,
        };
        Duration::from_millis(millis)
    }

    pub async fn on_timer(&mut self, ctx: &mut NodeCtx) {
        match self {
            Consensus::Raft(raft) => raft.on_timer(ctx).await,
            Consensus::Pow(pow) => pow.on_timer(ctx).await,
        }
    }

    pub async fn handle_command(
        &mut self,
        ctx: &mut NodeCtx,
        command: &str,
        data: Option<Value>,
        reply: Option<&ReplySink>,
    ) {
        match (&mut *self, command) {
            (Consensus::Raft(raft), "vote") => match parse(data) {
                Some(vote) => raft.handle_vote(ctx, vote, reply),
                None => debug!("malformed vote dropped"),
            },
            (Consensus::Raft(raft), "append") => match parse(data) {
                Some(append) => raft.handle_append(ctx, append, reply).await,
                None => debug!("malformed append dropped"),
            },
            (Consensus::Raft(raft), "addTransaction") => {
                raft.handle_client(ctx, EntryKind::Normal, data.unwrap_or(Value::Null))
                    .await
            }
            (Consensus::Raft(raft), "addTemporaryTransaction") => {
                raft.handle_client(ctx, EntryKind::Temporary, data.unwrap_or(Value::Null))
                    .await
            }
            (Consensus::Raft(raft), "commitTransaction") => {
                raft.handle_client(ctx, EntryKind::Commit, data.unwrap_or(Value::Null))
                    .await
            }
            (Consensus::Pow(pow), "addTransaction") => {
                pow.handle_client(ctx, EntryKind::Normal, data.unwrap_or(Value::Null), false)
            }
            (Consensus::Pow(pow), "addTemporaryTransaction") => {
                pow.handle_client(ctx, EntryKind::Temporary, data.unwrap_or(Value::Null), false)
            }
            (Consensus::Pow(pow), "commitTransaction") => {
                pow.handle_client(ctx, EntryKind::Commit, data.unwrap_or(Value::Null), false)
            }
            (Consensus::Pow(pow), "startPow") => pow.handle_start_pow(ctx, data, reply).await,
            _ => debug!(command, "command does not apply to the active consensus engine"),
        }
    }

    pub async fn handle_data(&mut self, ctx: &mut NodeCtx, name: &str, data: Option<Value>) {
        match (&mut *self, name) {
            (Consensus::Raft(raft), "voted") => match parse(data) {
                Some(voted) => raft.handle_voted(ctx, voted).await,
                None => debug!("malformed voted push dropped"),
            },
            (Consensus::Raft(raft), "appended") => match parse(data) {
                Some(appended) => raft.handle_appended(appended),
                None => debug!("malformed appended push dropped"),
            },
            // Forwarded client submissions from non-leader peers.
            (Consensus::Raft(raft), "transaction") => {
                raft.handle_client(ctx, EntryKind::Normal, data.unwrap_or(Value::Null))
                    .await
            }
            (Consensus::Raft(raft), "temporaryTransaction") => {
                raft.handle_client(ctx, EntryKind::Temporary, data.unwrap_or(Value::Null))
                    .await
            }
            (Consensus::Raft(raft), "committedTransaction") => {
                raft.handle_client(ctx, EntryKind::Commit, data.unwrap_or(Value::Null))
                    .await
            }
            // Pool gossip between proof-of-work peers.
            (Consensus::Pow(pow), "transaction") => {
                pow.handle_client(ctx, EntryKind::Normal, data.unwrap_or(Value::Null), true)
            }
            (Consensus::Pow(pow), "temporaryTransaction") => {
                pow.handle_client(ctx, EntryKind::Temporary, data.unwrap_or(Value::Null), true)
            }
            (Consensus::Pow(pow), "committedTransaction") => {
                pow.handle_client(ctx, EntryKind::Commit, data.unwrap_or(Value::Null), true)
            }
            (Consensus::Pow(pow), "pow" | "candidateForPow") => {
                pow.handle_proof(ctx, data.as_ref())
            }
            _ => debug!(name, "data push does not apply to the active consensus engine"),
        }
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    pub fn role_name(&self) -> &'static str {
        match self {
            Consensus::Raft(raft) => raft.role().name(),
            Consensus::Pow(_) => "miner",
        }
    }

    pub fn term(&self) -> u64 {
        match self {
            Consensus::Raft(raft) => raft.term(),
            Consensus::Pow(_) => 0,
        }
    }

    pub fn leader_id(&self) -> Option<String> {
        match self {
            Consensus::Raft(raft) => raft.leader_id().map(String::from),
            Consensus::Pow(_) => None,
        }
    }

    pub fn provisional_sequence(&self) -> u64 {
        match self {
            Consensus::Raft(raft) => raft.provisional_sequence(),
            Consensus::Pow(_) => 0,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Option<T> {
    serde_json::from_value(data?).ok()
}
