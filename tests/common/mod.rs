//! Shared cluster harness for integration tests.
//!
//! Nodes run on the in-process mesh, so multi-node consensus scenarios are
//! driven without sockets: deliver a command with a capture channel as the
//! reply sink, then poll until the cluster converges.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use ledgerlite::config::StorageKind;
use ledgerlite::{
    start_local, Block, ConsensusAlgorithm, Envelope, LocalMesh, NodeConfig, NodeHandle, PeerInfo,
    ReplySink,
};

pub struct Cluster {
    pub handles: Vec<NodeHandle>,
    pub mesh: LocalMesh,
    _dir: TempDir,
}

pub fn node_config(
    i: usize,
    n: usize,
    algorithm: ConsensusAlgorithm,
    index_keys: &[&str],
    dir: &TempDir,
) -> NodeConfig {
    NodeConfig {
        block_version: "1.0".into(),
        id: format!("n{}", i + 1),
        host: "mesh".into(),
        port: (7000 + i) as u16,
        protocol: "local".into(),
        consensus_algorithm: algorithm,
        storage: StorageKind::Indexed,
        storage_path: dir.path().join(format!("n{}", i + 1)),
        index_keys: index_keys.iter().map(|k| k.to_string()).collect(),
        keepalive_interval: 25,
        election_min_interval: 75,
        election_max_interval: 150,
        consensus_interval: 150,
        nodes: (0..n)
            .filter(|j| *j != i)
            .map(|j| PeerInfo {
                id: format!("n{}", j + 1),
                url: format!("local://mesh:{}", 7000 + j),
            })
            .collect(),
    }
}

pub async fn start_cluster(
    n: usize,
    algorithm: ConsensusAlgorithm,
    index_keys: &[&str],
) -> Cluster {
    start_cluster_with_interval(n, algorithm, index_keys, 150).await
}

/// Like [`start_cluster`] but with an explicit mining cadence, for tests
/// that must keep the autonomous miner out of the way.
pub async fn start_cluster_with_interval(
    n: usize,
    algorithm: ConsensusAlgorithm,
    index_keys: &[&str],
    consensus_interval: u64,
) -> Cluster {
    let mesh = LocalMesh::new();
    let dir = TempDir::new().unwrap();
    let handles = (0..n)
        .map(|i| {
            let mut config = node_config(i, n, algorithm, index_keys, &dir);
            config.consensus_interval = consensus_interval;
            start_local(config, &mesh).unwrap()
        })
        .collect();
    Cluster {
        handles,
        mesh,
        _dir: dir,
    }
}

/// Send a command and await its reply envelope.
pub async fn call(handle: &NodeHandle, envelope: Envelope) -> Envelope {
    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.deliver(envelope, Some(ReplySink::new(tx)));
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a reply")
        .expect("node dropped the reply channel")
}

pub fn reply_data(envelope: Envelope) -> Option<Value> {
    match envelope {
        Envelope::Data { data, .. } => data,
        Envelope::Command { .. } => None,
    }
}

/// Poll until the node serves the block at `index`.
pub async fn wait_for_block(handle: &NodeHandle, index: u64) -> Block {
    for _ in 0..200 {
        let reply = call(handle, Envelope::command("getBlock", json!(index))).await;
        if let Some(value) = reply_data(reply) {
            if !value.is_null() {
                return serde_json::from_value(value).expect("unparseable block");
            }
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("block {} never appeared", index);
}

pub async fn diagnostics(handle: &NodeHandle) -> Value {
    reply_data(call(handle, Envelope::bare_command("getDiagnostics")).await)
        .expect("diagnostics reply had no data")
}
