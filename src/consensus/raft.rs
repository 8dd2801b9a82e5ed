//! Leader-based replication of provisional blocks.
//!
//! A Raft-style protocol reduced to what a fixed-membership ledger needs:
//! randomized election timeouts, term-stamped votes, and a leader that
//! assigns a cluster-wide `sequence` to every client submission. Entries
//! are *provisional* until a quorum of followers has acknowledged them;
//! the leader's periodic sweep then drains acknowledged entries into the
//! blockchain engine, seals a block, and tells followers to do the same by
//! sequence list.
//!
//! Everything here runs on the node's single event loop, so there is no
//! locking around the provisional map or the backlogs; the only
//! suspension points are outbound sends.
//!
//! ```text
//!  client ──addTransaction──▶ follower ─forward─▶ leader
//!                                                   │ sequence += 1
//!                                                   ▼
//!                                     append{entry} ──▶ followers (ack)
//!                                                   │ quorum?
//!                                                   ▼
//!                                  append{sequences} ──▶ everyone seals
//! ```

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::message::Envelope;
use crate::node::{NodeCtx, ReplySink};

use super::{payload_ids, payload_transactions, EntryKind};

// ============================================================================
// WIRE PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteData {
    pub id: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotedData {
    pub granted: bool,
    pub from: String,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendData {
    pub id: String,
    pub term: u64,
    /// Present on heartbeats: the leader's current provisional sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<AppendEntry>,
}

/// Either one replicated entry (`sequence`/`transaction`/`type`) or a
/// commit instruction (`sequences`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EntryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequences: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendedData {
    pub from: String,
    pub term: u64,
    pub entry: SequenceRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRef {
    pub sequence: u64,
}

// ============================================================================
// ENGINE STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        }
    }
}

/// A sequenced client submission awaiting quorum. On the leader the
/// acknowledgment count starts at zero and grows with `appended` replies;
/// a follower records the entry with one acknowledgment (the leader's own).
#[derive(Debug, Clone)]
pub struct ProvisionalEntry {
    pub payload: Value,
    pub kind: EntryKind,
    pub consensus: u32,
    pub owner: String,
}

pub struct RaftEngine {
    role: Role,
    term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    /// Peers that granted us their vote this term.
    votes: HashSet<String>,
    /// Highest sequence this node knows about; only the leader mints new
    /// ones.
    provisional_sequence: u64,
    /// Sequences we know exist but whose entries never reached us.
    lost_sequences: HashSet<u64>,
    provisional: BTreeMap<u64, ProvisionalEntry>,
    /// Client submissions held while no leader is reachable, per kind.
    transaction_backlog: VecDeque<Value>,
    temporary_backlog: VecDeque<Value>,
    committed_backlog: VecDeque<Value>,
}

impl RaftEngine {
    pub fn new() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            votes: HashSet::new(),
            provisional_sequence: 0,
            lost_sequences: HashSet::new(),
            provisional: BTreeMap::new(),
            transaction_backlog: VecDeque::new(),
            temporary_backlog: VecDeque::new(),
            committed_backlog: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn leader_id(&self) -> Option<&str> {
        self.leader_id.as_deref()
    }

    pub fn provisional_sequence(&self) -> u64 {
        self.provisional_sequence
    }

    pub fn provisional_len(&self) -> usize {
        self.provisional.len()
    }

    fn backlog_mut(&mut self, kind: EntryKind) -> &mut VecDeque<Value> {
        match kind {
            EntryKind::Normal => &mut self.transaction_backlog,
            EntryKind::Temporary => &mut self.temporary_backlog,
            EntryKind::Commit => &mut self.committed_backlog,
        }
    }

    fn backlogs_empty(&self) -> bool {
        self.transaction_backlog.is_empty()
            && self.temporary_backlog.is_empty()
            && self.committed_backlog.is_empty()
    }

    // ========================================================================
    // TIMER
    // ========================================================================

    /// Leaders heartbeat and sweep; everyone else concludes the leader is
    /// gone and stands for election.
    pub async fn on_timer(&mut self, ctx: &mut NodeCtx) {
        match self.role {
            Role::Leader => {
                let heartbeat = self.heartbeat(ctx);
                ctx.broadcast(&heartbeat);
                self.sweep(ctx);
            }
            _ => self.start_election(ctx),
        }
    }

    fn start_election(&mut self, ctx: &mut NodeCtx) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(ctx.self_id().to_string());
        self.votes.clear();
        self.votes.insert(ctx.self_id().to_string());
        self.leader_id = None;
        info!(node = %ctx.self_id(), term = self.term, "election timeout, standing as candidate");
        let request = Envelope::command(
            "vote",
            VoteData {
                id: ctx.self_id().to_string(),
                term: self.term,
            },
        );
        ctx.broadcast(&request);
        // A single-node cluster is its own quorum.
        self.try_become_leader(ctx);
    }

    fn try_become_leader(&mut self, ctx: &mut NodeCtx) {
        if self.role != Role::Candidate || (self.votes.len() as u32) < ctx.quorum() {
            return;
        }
        self.role = Role::Leader;
        self.leader_id = Some(ctx.self_id().to_string());
        info!(node = %ctx.self_id(), term = self.term, votes = self.votes.len(), "elected leader");
        let heartbeat = self.heartbeat(ctx);
        ctx.broadcast(&heartbeat);
        ctx.reset_timer();
        // Anything queued while we had no leader is ours to sequence now.
        for kind in [EntryKind::Normal, EntryKind::Temporary, EntryKind::Commit] {
            while let Some(payload) = self.backlog_mut(kind).pop_front() {
                self.lead_accept(ctx, kind, payload);
            }
        }
    }

    // ========================================================================
    // ELECTION MESSAGES
    // ========================================================================

    pub fn handle_vote(&mut self, ctx: &mut NodeCtx, vote: VoteData, reply: Option<&ReplySink>) {
        if vote.term < self.term {
            debug!(from = %vote.id, term = vote.term, "stale vote request ignored");
            return;
        }
        if vote.term > self.term {
            self.term = vote.term;
            self.voted_for = None;
        }
        let granted = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == vote.id,
        };
        if granted {
            self.voted_for = Some(vote.id.clone());
            self.role = Role::Follower;
            ctx.reset_timer();
            debug!(node = %ctx.self_id(), candidate = %vote.id, term = self.term, "vote granted");
        }
        respond(
            reply,
            Envelope::data(
                "voted",
                VotedData {
                    granted,
                    from: ctx.self_id().to_string(),
                    term: self.term,
                },
            ),
        );
    }

    pub async fn handle_voted(&mut self, ctx: &mut NodeCtx, voted: VotedData) {
        if !voted.granted || self.role != Role::Candidate || voted.term != self.term {
            return;
        }
        self.votes.insert(voted.from);
        self.try_become_leader(ctx);
    }

    // ========================================================================
    // CLIENT SUBMISSIONS
    // ========================================================================

    /// A client submission, either direct or forwarded by a peer. Leaders
    /// sequence it immediately; everyone else queues it for the leader.
    pub async fn handle_client(&mut self, ctx: &mut NodeCtx, kind: EntryKind, payload: Value) {
        if payload.is_null() {
            debug!("client submission without payload dropped");
            return;
        }
        if self.role == Role::Leader {
            self.lead_accept(ctx, kind, payload);
        } else {
            self.backlog_mut(kind).push_back(payload);
            self.flush_backlogs(ctx).await;
        }
    }

    fn lead_accept(&mut self, ctx: &mut NodeCtx, kind: EntryKind, payload: Value) {
        self.provisional_sequence += 1;
        let sequence = self.provisional_sequence;
        self.provisional.insert(
            sequence,
            ProvisionalEntry {
                payload: payload.clone(),
                kind,
                consensus: 0,
                owner: ctx.self_id().to_string(),
            },
        );
        debug!(sequence, kind = ?kind, "provisional entry recorded");
        let append = self.entry_append(ctx, sequence, payload, kind);
        ctx.broadcast(&append);
    }

    /// Push backlogged submissions to the leader. Stops at the first
    /// delivery failure and keeps the rest queued; called again whenever a
    /// leader is (re)discovered, so retry cadence follows the election
    /// timers rather than a timer of its own.
    async fn flush_backlogs(&mut self, ctx: &mut NodeCtx) {
        if self.backlogs_empty() {
            return;
        }
        let Some(leader) = self.leader_id.clone() else {
            debug!("no known leader; client submissions stay backlogged");
            return;
        };
        if leader == ctx.self_id() {
            for kind in [EntryKind::Normal, EntryKind::Temporary, EntryKind::Commit] {
                while let Some(payload) = self.backlog_mut(kind).pop_front() {
                    self.lead_accept(ctx, kind, payload);
                }
            }
            return;
        }
        for kind in [EntryKind::Normal, EntryKind::Temporary, EntryKind::Commit] {
            while let Some(payload) = self.backlog_mut(kind).pop_front() {
                let envelope = Envelope::data(kind.forward_name(), &payload);
                if let Err(e) = ctx.send_to_peer(&leader, envelope).await {
                    warn!(leader = %leader, error = %e, "forward to leader failed, requeueing");
                    self.backlog_mut(kind).push_front(payload);
                    return;
                }
            }
        }
    }

    // ========================================================================
    // REPLICATION
    // ========================================================================

    pub async fn handle_append(
        &mut self,
        ctx: &mut NodeCtx,
        append: AppendData,
        reply: Option<&ReplySink>,
    ) {
        if append.term < self.term {
            debug!(from = %append.id, term = append.term, "append from a stale term ignored");
            return;
        }
        if append.term > self.term {
            if self.role == Role::Leader {
                info!(term = append.term, "deposed by a higher-term leader");
            }
            self.term = append.term;
            self.voted_for = None;
            self.role = Role::Follower;
        }
        if self.role == Role::Leader {
            warn!(from = %append.id, term = self.term, "second leader in the same term ignored");
            return;
        }
        self.role = Role::Follower;
        self.leader_id = Some(append.id.clone());
        ctx.reset_timer();
        self.flush_backlogs(ctx).await;

        match append.entry {
            // Bare heartbeat. Deliberately unacknowledged: heartbeat acks at
            // keepalive cadence from every follower would swamp the leader.
            None => {}
            Some(entry) => {
                if let Some(sequences) = entry.sequences {
                    self.follower_commit(ctx, sequences);
                } else if let (Some(sequence), Some(payload), Some(kind)) =
                    (entry.sequence, entry.transaction, entry.kind)
                {
                    self.follower_append(ctx, &append.id, sequence, payload, kind, reply);
                } else {
                    debug!("append entry missing fields, dropped");
                }
            }
        }
    }

    fn follower_append(
        &mut self,
        ctx: &NodeCtx,
        leader: &str,
        sequence: u64,
        payload: Value,
        kind: EntryKind,
        reply: Option<&ReplySink>,
    ) {
        // Re-delivery of a sequence we already hold: acknowledge again so a
        // rebroadcasting leader can make progress.
        if sequence <= self.provisional_sequence && !self.lost_sequences.contains(&sequence) {
            self.acknowledge(ctx, sequence, reply);
            return;
        }
        if sequence > self.provisional_sequence {
            if sequence > self.provisional_sequence + 1 {
                warn!(
                    from = self.provisional_sequence + 1,
                    to = sequence - 1,
                    "gap in replicated sequences recorded as lost"
                );
            }
            for missing in self.provisional_sequence + 1..sequence {
                self.lost_sequences.insert(missing);
            }
            self.provisional_sequence = sequence;
        } else {
            self.lost_sequences.remove(&sequence);
        }
        self.provisional.insert(
            sequence,
            ProvisionalEntry {
                payload,
                kind,
                consensus: 1,
                owner: leader.to_string(),
            },
        );
        self.acknowledge(ctx, sequence, reply);
    }

    fn acknowledge(&self, ctx: &NodeCtx, sequence: u64, reply: Option<&ReplySink>) {
        respond(
            reply,
            Envelope::data(
                "appended",
                AppendedData {
                    from: ctx.self_id().to_string(),
                    term: self.term,
                    entry: SequenceRef { sequence },
                },
            ),
        );
    }

    /// The leader told us a batch reached quorum. A batch only seals when
    /// every listed sequence is locally present; otherwise the whole
    /// instruction is skipped (the entries are either lost, to be re-driven
    /// by the leader, or already applied).
    fn follower_commit(&mut self, ctx: &mut NodeCtx, sequences: Vec<u64>) {
        if sequences.is_empty() {
            return;
        }
        if !sequences.iter().all(|s| self.provisional.contains_key(s)) {
            debug!(?sequences, "commit batch references unseen sequences, skipped");
            return;
        }
        for sequence in &sequences {
            if let Some(entry) = self.provisional.remove(sequence) {
                apply_entry(ctx, entry);
            }
        }
        match ctx.seal_block() {
            Ok(block) => debug!(index = block.index, "committed batch sealed"),
            Err(e) => error!(error = %e, "failed to seal committed batch"),
        }
    }

    pub fn handle_appended(&mut self, appended: AppendedData) {
        if self.role != Role::Leader || appended.term != self.term {
            return;
        }
        if let Some(entry) = self.provisional.get_mut(&appended.entry.sequence) {
            entry.consensus += 1;
            debug!(
                sequence = appended.entry.sequence,
                consensus = entry.consensus,
                from = %appended.from,
                "append acknowledged"
            );
        }
    }

    // ========================================================================
    // COMMIT SWEEP (leader)
    // ========================================================================

    /// Drain quorum-acknowledged entries into the chain and seal a block;
    /// re-drive entries inherited from a previous leader. If sealing fails
    /// the drained transactions stay pooled and ride the next sweep.
    fn sweep(&mut self, ctx: &mut NodeCtx) {
        let quorum = ctx.quorum();
        let self_id = ctx.self_id().to_string();

        let mut completed = Vec::new();
        let mut unprocessed = Vec::new();
        for (&sequence, entry) in &self.provisional {
            if entry.owner == self_id {
                if entry.consensus >= quorum {
                    completed.push(sequence);
                }
            } else if entry.consensus < quorum {
                unprocessed.push(sequence);
            }
        }

        for sequence in &completed {
            if let Some(entry) = self.provisional.remove(sequence) {
                apply_entry(ctx, entry);
            }
        }
        if !completed.is_empty() {
            let commit = self.commit_append(ctx, completed.clone());
            ctx.broadcast(&commit);
            match ctx.seal_block() {
                Ok(block) => {
                    info!(index = block.index, sequences = ?completed, "quorum batch sealed")
                }
                Err(e) => error!(
                    error = %e,
                    "leader failed to seal; transactions stay pooled for the next sweep"
                ),
            }
        }

        // Entries minted by a deposed leader: take ownership and re-drive.
        for sequence in unprocessed {
            let Some((payload, kind)) = self.provisional.get_mut(&sequence).map(|entry| {
                entry.consensus = 0;
                entry.owner = self_id.clone();
                (entry.payload.clone(), entry.kind)
            }) else {
                continue;
            };
            debug!(sequence, "re-driving provisional entry from previous leader");
            let append = self.entry_append(ctx, sequence, payload, kind);
            ctx.broadcast(&append);
        }
    }

    // ========================================================================
    // ENVELOPE BUILDERS
    // ========================================================================

    fn heartbeat(&self, ctx: &NodeCtx) -> Envelope {
        Envelope::command(
            "append",
            AppendData {
                id: ctx.self_id().to_string(),
                term: self.term,
                sequence: Some(self.provisional_sequence),
                entry: None,
            },
        )
    }

    fn entry_append(
        &self,
        ctx: &NodeCtx,
        sequence: u64,
        payload: Value,
        kind: EntryKind,
    ) -> Envelope {
        Envelope::command(
            "append",
            AppendData {
                id: ctx.self_id().to_string(),
                term: self.term,
                sequence: None,
                entry: Some(AppendEntry {
                    sequence: Some(sequence),
                    transaction: Some(payload),
                    kind: Some(kind),
                    sequences: None,
                }),
            },
        )
    }

    fn commit_append(&self, ctx: &NodeCtx, sequences: Vec<u64>) -> Envelope {
        Envelope::command(
            "append",
            AppendData {
                id: ctx.self_id().to_string(),
                term: self.term,
                sequence: None,
                entry: Some(AppendEntry {
                    sequence: None,
                    transaction: None,
                    kind: None,
                    sequences: Some(sequences),
                }),
            },
        )
    }
}

impl Default for RaftEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain one provisional entry into the blockchain engine by its kind.
fn apply_entry(ctx: &mut NodeCtx, entry: ProvisionalEntry) {
    match entry.kind {
        EntryKind::Normal => {
            for tx in payload_transactions(&entry.payload) {
                ctx.chain.add_transaction(tx, false);
            }
        }
        EntryKind::Temporary => {
            for tx in payload_transactions(&entry.payload) {
                ctx.chain.add_transaction(tx, true);
            }
        }
        EntryKind::Commit => {
            for id in payload_ids(&entry.payload) {
                ctx.chain.commit_transaction(&id);
            }
        }
    }
}

fn respond(reply: Option<&ReplySink>, envelope: Envelope) {
    match reply {
        Some(sink) => {
            if !sink.send(envelope) {
                debug!("reply channel closed before consensus response");
            }
        }
        None => debug!("consensus message arrived without a reply channel"),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsensusAlgorithm, NodeConfig, PeerInfo, StorageKind};
    use crate::node::{LocalMesh, NodeCtx, Outbound};
    use crate::store::BlockStore;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn config(id: &str, peers: &[&str]) -> NodeConfig {
        NodeConfig {
            block_version: "1.0".into(),
            id: id.into(),
            host: "127.0.0.1".into(),
            port: 0,
            protocol: "tcp".into(),
            consensus_algorithm: ConsensusAlgorithm::Raft,
            storage: StorageKind::Indexed,
            storage_path: "/tmp/unused".into(),
            index_keys: vec![],
            keepalive_interval: 50,
            election_min_interval: 100,
            election_max_interval: 200,
            consensus_interval: 1000,
            nodes: peers
                .iter()
                .map(|p| PeerInfo {
                    id: p.to_string(),
                    url: format!("local://{}", p),
                })
                .collect(),
        }
    }

    /// A context wired to an empty local mesh: broadcasts go nowhere, which
    /// is exactly what these state-machine tests want.
    fn ctx(id: &str, peers: &[&str], dir: &TempDir) -> NodeCtx {
        let store = Arc::new(BlockStore::open(dir.path(), vec![]).unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbound = Outbound::Local(LocalMesh::new().bind(tx));
        NodeCtx::new(Arc::new(config(id, peers)), store, outbound)
    }

    fn ctx_with_genesis(id: &str, peers: &[&str], dir: &TempDir) -> NodeCtx {
        let mut ctx = ctx(id, peers, dir);
        let genesis = ctx.chain.genesis_block(false);
        ctx.chain.set_blocks(vec![genesis]).unwrap();
        ctx
    }

    fn reply_channel() -> (ReplySink, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplySink::new(tx), rx)
    }

    fn entry_payload(id: &str) -> Value {
        json!({ "transactionId": id, "articleCode": "4900000000001" })
    }

    fn append_entry(leader: &str, term: u64, sequence: u64, id: &str) -> AppendData {
        AppendData {
            id: leader.into(),
            term,
            sequence: None,
            entry: Some(AppendEntry {
                sequence: Some(sequence),
                transaction: Some(entry_payload(id)),
                kind: Some(EntryKind::Normal),
                sequences: None,
            }),
        }
    }

    fn commit_entry(leader: &str, term: u64, sequences: Vec<u64>) -> AppendData {
        AppendData {
            id: leader.into(),
            term,
            sequence: None,
            entry: Some(AppendEntry {
                sequence: None,
                transaction: None,
                kind: None,
                sequences: Some(sequences),
            }),
        }
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();

        let (sink, mut rx) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n2".into(), term: 1 }, Some(&sink));
        match rx.try_recv().unwrap() {
            Envelope::Data { data_name, data } => {
                assert_eq!(data_name, "voted");
                let voted: VotedData = serde_json::from_value(data.unwrap()).unwrap();
                assert!(voted.granted);
                assert_eq!(voted.term, 1);
            }
            other => panic!("expected voted push, got {:?}", other),
        }

        // A competing candidate in the same term is refused.
        let (sink2, mut rx2) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n3".into(), term: 1 }, Some(&sink2));
        match rx2.try_recv().unwrap() {
            Envelope::Data { data, .. } => {
                let voted: VotedData = serde_json::from_value(data.unwrap()).unwrap();
                assert!(!voted.granted);
            }
            other => panic!("expected voted push, got {:?}", other),
        }

        // The same candidate asking again is re-granted.
        let (sink3, mut rx3) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n2".into(), term: 1 }, Some(&sink3));
        match rx3.try_recv().unwrap() {
            Envelope::Data { data, .. } => {
                let voted: VotedData = serde_json::from_value(data.unwrap()).unwrap();
                assert!(voted.granted);
            }
            other => panic!("expected voted push, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_higher_term_vote_resets_voted_for() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();

        let (sink, _rx) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n2".into(), term: 1 }, Some(&sink));

        let (sink2, mut rx2) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n3".into(), term: 2 }, Some(&sink2));
        match rx2.try_recv().unwrap() {
            Envelope::Data { data, .. } => {
                let voted: VotedData = serde_json::from_value(data.unwrap()).unwrap();
                assert!(voted.granted);
                assert_eq!(voted.term, 2);
            }
            other => panic!("expected voted push, got {:?}", other),
        }
        assert_eq!(raft.term(), 2);
    }

    #[tokio::test]
    async fn test_candidate_wins_with_quorum() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();

        raft.on_timer(&mut ctx).await; // election timeout
        assert_eq!(raft.role(), Role::Candidate);
        assert_eq!(raft.term(), 1);

        raft.handle_voted(&mut ctx, VotedData { granted: true, from: "n2".into(), term: 1 })
            .await;
        // Quorum of 3 is 2: own vote plus n2.
        assert_eq!(raft.role(), Role::Leader);
        assert_eq!(raft.leader_id(), Some("n1"));
    }

    #[tokio::test]
    async fn test_single_node_cluster_elects_itself() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx("n1", &[], &dir);
        let mut raft = RaftEngine::new();
        raft.on_timer(&mut ctx).await;
        assert_eq!(raft.role(), Role::Leader);
    }

    #[tokio::test]
    async fn test_stale_vote_ignored() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();
        raft.on_timer(&mut ctx).await; // term 1, candidate

        let (sink, mut rx) = reply_channel();
        raft.handle_vote(&mut ctx, VoteData { id: "n2".into(), term: 0 }, Some(&sink));
        assert!(rx.try_recv().is_err());
        assert_eq!(raft.role(), Role::Candidate);
    }

    #[tokio::test]
    async fn test_leader_sequences_and_seals_on_quorum() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_with_genesis("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();
        raft.on_timer(&mut ctx).await;
        raft.handle_voted(&mut ctx, VotedData { granted: true, from: "n2".into(), term: 1 })
            .await;
        assert_eq!(raft.role(), Role::Leader);

        raft.handle_client(&mut ctx, EntryKind::Normal, entry_payload("t-1"))
            .await;
        assert_eq!(raft.provisional_sequence(), 1);
        assert_eq!(raft.provisional_len(), 1);

        // One ack is below quorum: the sweep must not seal yet.
        raft.handle_appended(AppendedData {
            from: "n2".into(),
            term: 1,
            entry: SequenceRef { sequence: 1 },
        });
        raft.on_timer(&mut ctx).await;
        assert_eq!(raft.provisional_len(), 1);
        assert!(ctx.chain.store().get_block(1).unwrap().is_none());

        raft.handle_appended(AppendedData {
            from: "n3".into(),
            term: 1,
            entry: SequenceRef { sequence: 1 },
        });
        raft.on_timer(&mut ctx).await;
        assert_eq!(raft.provisional_len(), 0);
        let block = ctx.chain.store().get_block(1).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0]["transactionId"], json!("t-1"));
    }

    #[tokio::test]
    async fn test_follower_acks_and_tracks_gaps() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_with_genesis("n2", &["n1", "n3"], &dir);
        let mut raft = RaftEngine::new();

        let (sink, mut rx) = reply_channel();
        raft.handle_append(&mut ctx, append_entry("n1", 1, 1, "t-1"), Some(&sink))
            .await;
        assert_eq!(raft.provisional_sequence(), 1);
        match rx.try_recv().unwrap() {
            Envelope::Data { data_name, data } => {
                assert_eq!(data_name, "appended");
                let acked: AppendedData = serde_json::from_value(data.unwrap()).unwrap();
                assert_eq!(acked.entry.sequence, 1);
                assert_eq!(acked.from, "n2");
            }
            other => panic!("expected appended push, got {:?}", other),
        }

        // Sequence 3 arrives before 2: the gap is recorded, the ack still
        // goes out.
        let (sink2, mut rx2) = reply_channel();
        raft.handle_append(&mut ctx, append_entry("n1", 1, 3, "t-3"), Some(&sink2))
            .await;
        assert_eq!(raft.provisional_sequence(), 3);
        assert!(rx2.try_recv().is_ok());

        // Re-delivery of a known sequence is just re-acknowledged.
        let before = raft.provisional_len();
        let (sink3, mut rx3) = reply_channel();
        raft.handle_append(&mut ctx, append_entry("n1", 1, 1, "t-1"), Some(&sink3))
            .await;
        assert_eq!(raft.provisional_len(), before);
        assert!(rx3.try_recv().is_ok());

        // The lost sequence finally shows up and fills the hole.
        let (sink4, _rx4) = reply_channel();
        raft.handle_append(&mut ctx, append_entry("n1", 1, 2, "t-2"), Some(&sink4))
            .await;
        assert_eq!(raft.provisional_len(), 3);
        assert_eq!(raft.provisional_sequence(), 3);
    }

    #[tokio::test]
    async fn test_follower_commit_requires_all_sequences() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_with_genesis("n2", &["n1", "n3"], &dir);
        let mut raft = RaftEngine::new();

        let (sink, _rx) = reply_channel();
        raft.handle_append(&mut ctx, append_entry("n1", 1, 1, "t-1"), Some(&sink))
            .await;

        // Commit names a sequence we never received: nothing seals.
        raft.handle_append(&mut ctx, commit_entry("n1", 1, vec![1, 2]), None)
            .await;
        assert!(ctx.chain.store().get_block(1).unwrap().is_none());
        assert_eq!(raft.provisional_len(), 1);

        raft.handle_append(&mut ctx, append_entry("n1", 1, 2, "t-2"), Some(&sink))
            .await;
        raft.handle_append(&mut ctx, commit_entry("n1", 1, vec![1, 2]), None)
            .await;
        let block = ctx.chain.store().get_block(1).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(raft.provisional_len(), 0);
    }

    #[tokio::test]
    async fn test_append_from_higher_term_deposes_leader() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_with_genesis("n1", &["n2", "n3"], &dir);
        let mut raft = RaftEngine::new();
        raft.on_timer(&mut ctx).await;
        raft.handle_voted(&mut ctx, VotedData { granted: true, from: "n2".into(), term: 1 })
            .await;
        assert_eq!(raft.role(), Role::Leader);

        raft.handle_append(
            &mut ctx,
            AppendData { id: "n3".into(), term: 5, sequence: Some(0), entry: None },
            None,
        )
        .await;
        assert_eq!(raft.role(), Role::Follower);
        assert_eq!(raft.term(), 5);
        assert_eq!(raft.leader_id(), Some("n3"));
    }

    #[tokio::test]
    async fn test_temporary_then_commit_flow() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx_with_genesis("n2", &["n1", "n3"], &dir);
        let mut raft = RaftEngine::new();

        let (sink, _rx) = reply_channel();
        let mut temp = append_entry("n1", 1, 1, "t-1");
        temp.entry.as_mut().unwrap().kind = Some(EntryKind::Temporary);
        raft.handle_append(&mut ctx, temp, Some(&sink)).await;

        let commit_tx = AppendData {
            id: "n1".into(),
            term: 1,
            sequence: None,
            entry: Some(AppendEntry {
                sequence: Some(2),
                transaction: Some(json!("t-1")),
                kind: Some(EntryKind::Commit),
                sequences: None,
            }),
        };
        raft.handle_append(&mut ctx, commit_tx, Some(&sink)).await;
        raft.handle_append(&mut ctx, commit_entry("n1", 1, vec![1, 2]), None)
            .await;

        let block = ctx.chain.store().get_block(1).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(block.transactions[0]["transactionId"], json!("t-1"));
        assert!(!block.transactions[0].contains_key("@temp"));
    }
}
