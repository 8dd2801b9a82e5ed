//! Error types shared across the node.
//!
//! The taxonomy mirrors how errors are actually handled:
//! - `Config` is fatal at startup only
//! - `Storage` propagates to the caller, which logs and aborts the current
//!   operation without touching state
//! - `Validation` rejects a bulk write (`setBlocks`) or a proof-of-work
//!   commit; nothing partial is applied
//! - `Transport` tears down the offending connection
//! - malformed messages surface as `Serialization` and are dropped silently
//!   at the transport boundary

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("consensus error: {0}")]
    Consensus(String),
}

impl NodeError {
    /// Wrap any storage-layer failure (redb has several error types; callers
    /// only ever log or abort, so the message is all that matters here).
    pub fn storage(err: impl std::fmt::Display) -> Self {
        NodeError::Storage(err.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        NodeError::Transport(err.to_string())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        NodeError::Validation(msg.into())
    }
}
