//! Node orchestrator.
//!
//! One event loop per node owns every piece of mutable consensus state:
//! inbound envelopes, timer fires, and shutdown all arrive as events on a
//! single queue, so the consensus engine, the transaction pool, and the
//! observer list never need locks. Network sends and store writes are the
//! only suspension points.
//!
//! On startup the node asks one random peer for the membership list and
//! the full chain (`getNodes`, then `getBlocks {direction: forward}`),
//! then starts its consensus timer. Shutdown cancels the timer, closes
//! the listener, and lets the store close with the last reference.

pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chain::{Block, BlockchainEngine};
use crate::config::{ConsensusAlgorithm, NodeConfig, PeerInfo};
use crate::consensus::Consensus;
use crate::error::{NodeError, Result};
use crate::message::{require_index, Envelope};
use crate::store::query::BlockQuery;
use crate::store::BlockStore;

pub use transport::{LocalMesh, NodeEvent, Outbound, ReplySink, TcpMesh, TcpServer};

// ============================================================================
// SHARED CONTEXT
// ============================================================================

/// Everything the consensus engines and the dispatcher share: the chain
/// engine, cluster membership, observers, and the way out to the network.
/// Owned by the event loop; never locked.
pub struct NodeCtx {
    pub config: Arc<NodeConfig>,
    pub chain: BlockchainEngine,
    /// Cluster membership in configuration order. Append-only: peers
    /// discovered through `getNodes` responses are added, never removed.
    pub peers: Vec<PeerInfo>,
    /// Clients that asked to be pushed every sealed block.
    pub observers: Vec<ReplySink>,
    pub outbound: Outbound,
    /// One ordered delivery lane per peer: broadcasts enqueue synchronously
    /// here, so messages to a given peer arrive in the order they were
    /// produced even though actual delivery is asynchronous.
    lanes: HashMap<String, mpsc::UnboundedSender<Envelope>>,
    /// Set by the engines when the logical timer must be rearmed.
    timer_reset: AtomicBool,
}

impl NodeCtx {
    pub fn new(config: Arc<NodeConfig>, store: Arc<BlockStore>, outbound: Outbound) -> Self {
        let chain = BlockchainEngine::new(config.block_version.clone(), store);
        let peers = config.nodes.clone();
        Self {
            config,
            chain,
            peers,
            observers: Vec::new(),
            outbound,
            lanes: HashMap::new(),
            timer_reset: AtomicBool::new(false),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.config.id
    }

    /// Majority of the cluster, this node included.
    pub fn quorum(&self) -> u32 {
        (self.peers.len() as u32 + 1) / 2 + 1
    }

    pub fn reset_timer(&self) {
        self.timer_reset.store(true, Ordering::SeqCst);
    }

    fn take_timer_reset(&mut self) -> bool {
        self.timer_reset.swap(false, Ordering::SeqCst)
    }

    fn peer_url(&self, id: &str) -> Option<String> {
        self.peers.iter().find(|p| p.id == id).map(|p| p.url.clone())
    }

    /// Fire-and-forget delivery to every peer. Envelopes enter each peer's
    /// lane synchronously, so consecutive broadcasts keep their order on
    /// the wire; delivery failures are logged by the lane task.
    pub fn broadcast(&mut self, envelope: &Envelope) {
        let peers = self.peers.clone();
        for peer in &peers {
            let _ = self.lane(peer).send(envelope.clone());
        }
    }

    fn lane(&mut self, peer: &PeerInfo) -> &mpsc::UnboundedSender<Envelope> {
        if !self.lanes.contains_key(&peer.id) {
            let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
            let outbound = self.outbound.clone();
            let url = peer.url.clone();
            let peer_id = peer.id.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    if let Err(e) = outbound.send(&url, envelope).await {
                        debug!(peer = %peer_id, error = %e, "delivery failed");
                    }
                }
            });
            self.lanes.insert(peer.id.clone(), tx);
        }
        &self.lanes[&peer.id]
    }

    /// Targeted delivery with the error surfaced, so forwarding can
    /// requeue on failure.
    pub async fn send_to_peer(&self, id: &str, envelope: Envelope) -> Result<()> {
        let url = self
            .peer_url(id)
            .ok_or_else(|| NodeError::Transport(format!("unknown peer \"{}\"", id)))?;
        self.outbound.send(&url, envelope).await
    }

    fn add_peers(&mut self, discovered: Vec<PeerInfo>) {
        for peer in discovered {
            if peer.id == self.config.id || self.peers.iter().any(|p| p.id == peer.id) {
                continue;
            }
            info!(peer = %peer.id, url = %peer.url, "peer discovered");
            self.peers.push(peer);
        }
    }

    /// Push a sealed block to every observer, dropping the ones whose
    /// connection has gone away.
    pub fn notify_observers(&mut self, block: &Block) {
        if self.observers.is_empty() {
            return;
        }
        let envelope = Envelope::data("block", block);
        let before = self.observers.len();
        self.observers.retain(|observer| observer.send(envelope.clone()));
        if self.observers.len() < before {
            debug!(reaped = before - self.observers.len(), "dead observers dropped");
        }
    }

    /// Seal the confirmed pool into a block and notify observers. Used by
    /// the consensus engines at commit time.
    pub fn seal_block(&mut self) -> Result<Block> {
        let block = self.chain.commit_block()?;
        info!(
            index = block.index,
            transactions = block.transactions.len(),
            "block sealed"
        );
        self.notify_observers(&block);
        Ok(block)
    }
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub id: String,
    pub role: &'static str,
    pub term: u64,
    pub leader_id: Option<String>,
    pub provisional_sequence: u64,
    pub pool_size: usize,
    pub last_block_index: Option<u64>,
    pub peer_count: usize,
    pub observer_count: usize,
}

// ============================================================================
// NODE
// ============================================================================

pub struct Node {
    ctx: NodeCtx,
    consensus: Consensus,
    events: mpsc::UnboundedReceiver<NodeEvent>,
}

/// Posting side of a node's event queue.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    pub fn deliver(&self, envelope: Envelope, reply: Option<ReplySink>) {
        let _ = self.tx.send(NodeEvent::Message { envelope, reply });
    }

    pub fn terminate(&self) {
        let _ = self.tx.send(NodeEvent::Terminate);
    }
}

/// A TCP-backed node: the loop task plus its listener.
pub struct NodeRuntime {
    pub handle: NodeHandle,
    pub server: TcpServer,
    pub join: JoinHandle<()>,
}

/// Boot a node over TCP. Fatal errors (storage, bind) surface here; after
/// this the node only ever logs and carries on.
pub async fn start(config: NodeConfig) -> Result<NodeRuntime> {
    config.validate()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let store = Arc::new(BlockStore::open(
        &config.storage_path,
        config.index_keys.clone(),
    )?);
    let listen_addr = format!("{}:{}", config.host, config.port);
    let server = TcpServer::bind(&listen_addr, tx.clone()).await?;
    let outbound = Outbound::Tcp(TcpMesh::new(tx.clone()));
    let node = Node::new(Arc::new(config), store, outbound, rx);
    let join = tokio::spawn(node.run());
    Ok(NodeRuntime {
        handle: NodeHandle { tx },
        server,
        join,
    })
}

/// Boot a node on an in-process mesh (cluster tests).
pub fn start_local(config: NodeConfig, mesh: &LocalMesh) -> Result<NodeHandle> {
    config.validate()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let store = Arc::new(BlockStore::open(
        &config.storage_path,
        config.index_keys.clone(),
    )?);
    mesh.register(&config.self_url(), tx.clone());
    let outbound = Outbound::Local(mesh.bind(tx.clone()));
    let node = Node::new(Arc::new(config), store, outbound, rx);
    tokio::spawn(node.run());
    Ok(NodeHandle { tx })
}

impl Node {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<BlockStore>,
        outbound: Outbound,
        events: mpsc::UnboundedReceiver<NodeEvent>,
    ) -> Self {
        let consensus = Consensus::from_config(&config);
        let ctx = NodeCtx::new(config, store, outbound);
        Self {
            ctx,
            consensus,
            events,
        }
    }

    pub async fn run(mut self) {
        info!(
            node = %self.ctx.self_id(),
            algorithm = ?self.ctx.config.consensus_algorithm,
            peers = self.ctx.peers.len(),
            "node starting"
        );
        self.bootstrap().await;

        let mut deadline = Instant::now() + self.consensus.timer_interval(&self.ctx.config);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(NodeEvent::Message { envelope, reply }) => {
                        self.dispatch(envelope, reply).await;
                    }
                    Some(NodeEvent::Terminate) | None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.consensus.on_timer(&mut self.ctx).await;
                    self.ctx.reset_timer();
                }
            }
            if self.ctx.take_timer_reset() {
                deadline = Instant::now() + self.consensus.timer_interval(&self.ctx.config);
            }
        }
        info!(node = %self.ctx.self_id(), "node terminated");
    }

    /// Catch up from one random peer before consensus starts. Responses
    /// arrive asynchronously as `nodes` / `blocks` pushes.
    async fn bootstrap(&mut self) {
        let Some(peer) = self.ctx.peers.choose(&mut rand::thread_rng()).cloned() else {
            return;
        };
        info!(peer = %peer.id, "bootstrapping from peer");
        let catch_up = [
            Envelope::bare_command("getNodes"),
            Envelope::command("getBlocks", json!({ "direction": "forward" })),
        ];
        for envelope in catch_up {
            if let Err(e) = self.ctx.outbound.send(&peer.url, envelope).await {
                warn!(peer = %peer.id, error = %e, "bootstrap request failed");
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope, reply: Option<ReplySink>) {
        match envelope {
            Envelope::Command { command, data } => {
                self.dispatch_command(&command, data, reply).await;
            }
            Envelope::Data { data_name, data } => {
                self.dispatch_data(&data_name, data).await;
            }
        }
    }

    async fn dispatch_command(
        &mut self,
        command: &str,
        data: Option<Value>,
        reply: Option<ReplySink>,
    ) {
        match command {
            "getNodes" => {
                let mut nodes = vec![self.ctx.config.self_peer()];
                nodes.extend(self.ctx.peers.iter().cloned());
                respond(reply, Envelope::data("nodes", nodes));
            }
            "getBlock" => match require_index(data.as_ref()) {
                Ok(index) => match self.ctx.chain.store().get_block(index) {
                    Ok(block) => respond(reply, Envelope::data("block", block)),
                    Err(e) => warn!(index, error = %e, "getBlock failed"),
                },
                Err(e) => debug!(error = %e, "getBlock with unusable index dropped"),
            },
            "getBlocks" => self.get_blocks(data, reply),
            "generateGenesisBlock" => self.generate_genesis(),
            "addObserver" => match reply {
                Some(sink) => {
                    self.ctx.observers.push(sink);
                    debug!(observers = self.ctx.observers.len(), "observer registered");
                }
                None => debug!("addObserver over a transport without replies ignored"),
            },
            "getDiagnostics" => {
                let snapshot = self.diagnostics();
                respond(reply, Envelope::data("diagnostics", snapshot));
            }
            "addTransaction" | "addTemporaryTransaction" | "commitTransaction" | "vote"
            | "append" | "startPow" => {
                self.consensus
                    .handle_command(&mut self.ctx, command, data, reply.as_ref())
                    .await;
            }
            other => debug!(command = other, "unknown command ignored"),
        }
    }

    async fn dispatch_data(&mut self, name: &str, data: Option<Value>) {
        match name {
            "nodes" => match data.map(serde_json::from_value::<Vec<PeerInfo>>) {
                Some(Ok(discovered)) => self.ctx.add_peers(discovered),
                _ => debug!("malformed nodes push dropped"),
            },
            "blocks" => match data.map(serde_json::from_value::<Vec<Block>>) {
                Some(Ok(blocks)) => match self.ctx.chain.set_blocks(blocks) {
                    Ok(applied) if !applied.is_empty() => {
                        info!(
                            count = applied.len(),
                            head = applied.last().map(|b| b.index),
                            "chain extended from peer"
                        );
                        for block in &applied {
                            self.ctx.notify_observers(block);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "incoming blocks rejected"),
                },
                _ => debug!("malformed blocks push dropped"),
            },
            // Observer pushes bounced back at us carry nothing to do.
            "block" => {}
            "voted" | "appended" | "transaction" | "temporaryTransaction"
            | "committedTransaction" | "pow" | "candidateForPow" => {
                self.consensus.handle_data(&mut self.ctx, name, data).await;
            }
            other => debug!(data_name = other, "unknown data push ignored"),
        }
    }

    /// `getBlocks` serves two masters: a bare forward query is the chain
    /// sync used by bootstrapping peers and must include genesis; every
    /// other shape goes through the query evaluator, which excludes it.
    fn get_blocks(&mut self, data: Option<Value>, reply: Option<ReplySink>) {
        let query: BlockQuery = match data {
            None | Some(Value::Null) => BlockQuery::default(),
            Some(raw) => match serde_json::from_value(raw) {
                Ok(query) => query,
                Err(e) => {
                    debug!(error = %e, "malformed getBlocks query dropped");
                    return;
                }
            },
        };
        if query.is_chain_sync() {
            match self.ctx.chain.store().dump_chain() {
                Ok(chain) => respond(reply, Envelope::data("blocks", chain)),
                Err(e) => warn!(error = %e, "chain dump failed"),
            }
            return;
        }
        match self.ctx.chain.store().restore_blocks(&query) {
            Ok(hits) => respond(reply, Envelope::data("blocks", hits)),
            Err(e) => warn!(error = %e, "getBlocks failed"),
        }
    }

    /// Create block 0 locally and hand it to every peer. A repeated
    /// request is a no-op (the chain already has a head).
    fn generate_genesis(&mut self) {
        let proof_of_work = self.ctx.config.consensus_algorithm == ConsensusAlgorithm::PoW;
        let genesis = self.ctx.chain.genesis_block(proof_of_work);
        match self.ctx.chain.set_blocks(vec![genesis.clone()]) {
            Ok(applied) if !applied.is_empty() => {
                info!(hash = %genesis.hash, "genesis block created");
                self.ctx.notify_observers(&genesis);
                self.ctx.broadcast(&Envelope::data("blocks", vec![genesis]));
            }
            Ok(_) => debug!("genesis requested but the chain already has blocks"),
            Err(e) => error!(error = %e, "genesis creation failed"),
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            id: self.ctx.config.id.clone(),
            role: self.consensus.role_name(),
            term: self.consensus.term(),
            leader_id: self.consensus.leader_id(),
            provisional_sequence: self.consensus.provisional_sequence(),
            pool_size: self.ctx.chain.pool_size(),
            last_block_index: self.ctx.chain.store().last_index().unwrap_or(None),
            peer_count: self.ctx.peers.len(),
            observer_count: self.ctx.observers.len(),
        }
    }
}

fn respond(reply: Option<ReplySink>, envelope: Envelope) {
    match reply {
        Some(sink) => {
            if !sink.send(envelope) {
                debug!("reply channel closed before response");
            }
        }
        None => debug!("command needing a reply arrived without a reply channel"),
    }
}
