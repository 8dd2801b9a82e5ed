//! Node configuration.
//!
//! Loaded once at startup from a JSON file (camelCase keys, matching the
//! wire format). Misconfiguration here is the only class of error that
//! terminates the process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

fn default_block_version() -> String {
    "1.0".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_keepalive_interval() -> u64 {
    1000
}

fn default_election_min_interval() -> u64 {
    150
}

fn default_election_max_interval() -> u64 {
    300
}

fn default_consensus_interval() -> u64 {
    10_000
}

// ============================================================================
// CONFIG TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusAlgorithm {
    Raft,
    PoW,
}

/// Storage backend selector. Only the indexed (LevelDB-style) variant is
/// implemented; `Simple` is recognized so the error message is precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StorageKind {
    #[default]
    #[serde(rename = "LevelDB")]
    Indexed,
    Simple,
}

/// A peer node as listed in the cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    #[serde(default = "default_block_version")]
    pub block_version: String,

    /// This node's identity within the cluster.
    pub id: String,

    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,

    pub consensus_algorithm: ConsensusAlgorithm,

    #[serde(default)]
    pub storage: StorageKind,
    pub storage_path: PathBuf,

    /// Transaction attributes that get a secondary index in the block store.
    #[serde(default)]
    pub index_keys: Vec<String>,

    /// Leader heartbeat cadence, milliseconds.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    /// Election timeout is drawn uniformly from [min, max) milliseconds.
    #[serde(default = "default_election_min_interval")]
    pub election_min_interval: u64,
    #[serde(default = "default_election_max_interval")]
    pub election_max_interval: u64,
    /// Proof-of-work mining cadence, milliseconds.
    #[serde(default = "default_consensus_interval")]
    pub consensus_interval: u64,

    /// Peers, excluding this node. Fixed at startup; peers discovered via
    /// `getNodes` are appended at runtime but never removed.
    #[serde(default)]
    pub nodes: Vec<PeerInfo>,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        // Tolerate configs that list the node itself among its peers.
        let own_id = config.id.clone();
        config.nodes.retain(|p| p.id != own_id);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(NodeError::Config("node id must not be empty".into()));
        }
        if self.storage == StorageKind::Simple {
            return Err(NodeError::Config(
                "storage \"Simple\" is not supported by this build; use \"LevelDB\"".into(),
            ));
        }
        if self.election_min_interval >= self.election_max_interval {
            return Err(NodeError::Config(format!(
                "electionMinInterval ({}) must be below electionMaxInterval ({})",
                self.election_min_interval, self.election_max_interval
            )));
        }
        if self.keepalive_interval == 0 || self.consensus_interval == 0 {
            return Err(NodeError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    /// The URL peers use to reach this node.
    pub fn self_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn self_peer(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            url: self.self_url(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
