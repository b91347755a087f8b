//! Error types for the Cairn metadata store.
//!
//! This module provides a unified error type [`CairnError`] for all Cairn
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Transport**: connection, framing, and socket errors
//! - **Protocol**: version mismatches and out-of-state messages
//! - **Election**: inconclusive or aborted ballots
//! - **Persistence**: store corruption and log conflicts
//! - **Configuration**: invalid settings
//!
//! Transport errors are recovered locally by supervisor retry with
//! exponential backoff; everything on the data plane surfaces to the
//! client through an abort or an error response.

use crate::types::{Epoch, Txnid};
use std::io;
use thiserror::Error;

/// Main error type for Cairn operations.
#[derive(Error, Debug)]
pub enum CairnError {
    // Transport errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("peer pipe closed")]
    PipeClosed,

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    // Protocol errors
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stale leader: offered epoch {offered} below accepted epoch {accepted}")]
    StaleLeader { offered: Epoch, accepted: Epoch },

    // Election errors
    #[error("election inconclusive")]
    ElectionInconclusive,

    #[error("no message endpoint known for elected peer {0}")]
    UnknownWinner(String),

    // Epoch / txnid exhaustion. Both are fatal for the current reign.
    #[error("epoch overflow at {0}")]
    EpochOverflow(Epoch),

    #[error("txnid counter exhausted in epoch {0}")]
    CounterOverflow(Epoch),

    // Persistence errors
    #[error("store corrupt: {0}")]
    CorruptStore(String),

    #[error("log conflict: txnid {txnid} already logged with different payload")]
    LogConflict { txnid: Txnid },

    #[error("log gap: {txnid} does not follow {last}")]
    LogGap { txnid: Txnid, last: Txnid },

    #[error("commit out of order: {txnid} not above last committed {last}")]
    CommitOutOfOrder { txnid: Txnid, last: Txnid },

    #[error("storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    // Consensus errors
    #[error("not the leader; leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("leader lost quorum contact")]
    QuorumLost,

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CairnError {
    /// Check if the error is transient and worth a supervisor retry.
    ///
    /// Data-plane errors (persistence, protocol violations) are never
    /// retryable; they must surface to the client.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CairnError::ConnectionFailed(_)
                | CairnError::PipeClosed
                | CairnError::Timeout(_)
                | CairnError::ElectionInconclusive
                | CairnError::NotLeader { .. }
                | CairnError::QuorumLost
                | CairnError::Io(_)
        )
    }
}

impl From<bincode::Error> for CairnError {
    fn from(e: bincode::Error) -> Self {
        CairnError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CairnError {
    fn from(e: serde_json::Error) -> Self {
        CairnError::Serialization(e.to_string())
    }
}

impl From<rocksdb::Error> for CairnError {
    fn from(e: rocksdb::Error) -> Self {
        CairnError::Storage(e.to_string())
    }
}

/// Result type alias for Cairn operations.
pub type Result<T> = std::result::Result<T, CairnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CairnError::PipeClosed.is_retryable());
        assert!(CairnError::ElectionInconclusive.is_retryable());
        assert!(CairnError::QuorumLost.is_retryable());

        assert!(!CairnError::LogConflict {
            txnid: Txnid::new(1, 1)
        }
        .is_retryable());
        assert!(!CairnError::VersionMismatch {
            expected: 1,
            got: 2
        }
        .is_retryable());
    }
}
