//! Proof-of-work variant.
//!
//! No leader and no replication protocol: every node carries the same
//! transaction pool (client submissions are gossiped to all peers on
//! arrival), and the consensus timer periodically mines the pool into a
//! candidate. Whoever seals first broadcasts the winning
//! `{index, rootHash, nonce}`; everyone else verifies it against their own
//! pool and seals the identical block. A candidate for an already-sealed
//! index is silently ignored, so the race is harmless.
//!
//! `startPow` lets a client coordinate a cluster-wide mining round: the
//! node sleeps until `beginTime`, mines, and replies with the candidate so
//! the caller can distribute it.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::chain::block::now_millis;
use crate::error::NodeError;
use crate::message::{parse_index, Envelope};
use crate::node::{NodeCtx, ReplySink};

use super::{payload_ids, payload_transactions, EntryKind};

pub struct PowEngine;

impl PowEngine {
    pub fn new() -> Self {
        Self
    }

    // ========================================================================
    // MINING
    // ========================================================================

    /// One mining tick: seal the local pool and publish the proof.
    pub async fn on_timer(&mut self, ctx: &mut NodeCtx) {
        if ctx.chain.confirmed_count() == 0 {
            return;
        }
        let candidate = match ctx.chain.proof_of_work() {
            Ok(candidate) => candidate,
            Err(e) => {
                debug!(error = %e, "mining tick skipped");
                return;
            }
        };
        match ctx
            .chain
            .commit_proof_of_work(candidate.index, &candidate.root_hash, candidate.nonce)
        {
            Ok(Some(block)) => {
                info!(index = block.index, nonce = block.nonce, "mined and sealed block");
                ctx.notify_observers(&block);
                ctx.broadcast(&Envelope::data("pow", &candidate));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to seal own candidate"),
        }
    }

    /// Coordinated mining round: wait for the agreed start, mine, and hand
    /// the candidate back to the caller.
    pub async fn handle_start_pow(
        &mut self,
        ctx: &mut NodeCtx,
        data: Option<Value>,
        reply: Option<&ReplySink>,
    ) {
        if let Some(begin) = data
            .as_ref()
            .and_then(|d| d.get("beginTime"))
            .and_then(parse_index)
        {
            let now = now_millis();
            if begin > now {
                tokio::time::sleep(Duration::from_millis(begin - now)).await;
            }
        }
        match ctx.chain.proof_of_work() {
            Ok(candidate) => {
                if let Some(sink) = reply {
                    if !sink.send(Envelope::data("candidateForPow", &candidate)) {
                        debug!("startPow caller went away before the candidate was found");
                    }
                }
            }
            Err(e) => warn!(error = %e, "startPow requested with nothing to mine"),
        }
    }

    /// A proof found elsewhere (`pow` gossip or a client-distributed
    /// `candidateForPow`). Strict about shapes: a non-integral index or
    /// nonce is rejected rather than silently no-oped.
    pub fn handle_proof(&mut self, ctx: &mut NodeCtx, data: Option<&Value>) {
        let Some(data) = data else {
            debug!("proof push without payload dropped");
            return;
        };
        let index = data.get("index").and_then(parse_index);
        let root_hash = data.get("rootHash").and_then(Value::as_str);
        let nonce = data.get("nonce").and_then(parse_index);
        let (Some(index), Some(root_hash), Some(nonce)) = (index, root_hash, nonce) else {
            warn!("malformed proof-of-work payload rejected");
            return;
        };
        match ctx.chain.commit_proof_of_work(index, root_hash, nonce) {
            Ok(Some(block)) => {
                info!(index = block.index, "sealed block from peer proof");
                ctx.notify_observers(&block);
            }
            Ok(None) => debug!(index, "proof for an already-sealed block ignored"),
            Err(NodeError::Validation(reason)) => {
                warn!(index, %reason, "peer proof rejected")
            }
            Err(e) => warn!(error = %e, "proof commit failed"),
        }
    }

    // ========================================================================
    // POOL GOSSIP
    // ========================================================================

    /// Client submissions apply to the local pool directly; first-hand
    /// submissions are also gossiped so every pool converges before the
    /// next mining tick.
    pub fn handle_client(
        &mut self,
        ctx: &mut NodeCtx,
        kind: EntryKind,
        payload: Value,
        from_peer: bool,
    ) {
        if payload.is_null() {
            debug!("client submission without payload dropped");
            return;
        }
        match kind {
            EntryKind::Normal => {
                for tx in payload_transactions(&payload) {
                    ctx.chain.add_transaction(tx, false);
                }
            }
            EntryKind::Temporary => {
                for tx in payload_transactions(&payload) {
                    ctx.chain.add_transaction(tx, true);
                }
            }
            EntryKind::Commit => {
                for id in payload_ids(&payload) {
                    ctx.chain.commit_transaction(&id);
                }
            }
        }
        if !from_peer {
            ctx.broadcast(&Envelope::data(kind.forward_name(), &payload));
        }
    }
}

impl Default for PowEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
