//! ledgerlite: an ultra-lightweight replicated JSON ledger node
//!
//! A fixed-membership cluster accepts arbitrary JSON transactions, batches
//! them into hash-chained blocks, and replicates them under a leader-based
//! consensus protocol (with an optional proof-of-work variant). Clients
//! talk to any node; an observer channel pushes every sealed block.
//!
//! ## Architecture
//!
//! - [`consensus`]: Raft-style election and provisional-block replication,
//!   plus the proof-of-work miner
//! - [`chain`]: transaction pool, merkle roots, block sealing and chain
//!   validation
//! - [`store`]: redb-backed indexed block store with the query evaluator
//! - [`node`]: per-node event loop, dispatch, observers, TCP transport
//! - [`config`] / [`message`] / [`error`]: startup configuration, wire
//!   envelopes, error taxonomy

#![forbid(unsafe_code)]

// ============================================================================
// CORE
// ============================================================================
pub mod chain;
pub mod consensus;
pub mod store;

// ============================================================================
// NODE & WIRE
// ============================================================================
pub mod message;
pub mod node;

// ============================================================================
// SUPPORT
// ============================================================================
pub mod config;
pub mod error;

// ============================================================================
// PUBLIC API
// ============================================================================

pub use chain::{Block, BlockchainEngine, PowCandidate, Transaction};
pub use config::{ConsensusAlgorithm, NodeConfig, PeerInfo};
pub use error::{NodeError, Result};
pub use message::Envelope;
pub use node::{start, start_local, LocalMesh, Node, NodeHandle, NodeRuntime, ReplySink};
pub use store::query::{BlockQuery, Direction, QueryHit};
pub use store::BlockStore;
