//! Core type definitions for the Cairn metadata store.
//!
//! This module contains the fundamental data types used throughout Cairn:
//! transaction identifiers, epochs, peer identities, and the operation
//! codes carried by replicated mutations.
//!
//! # Key Types
//!
//! - [`Txnid`]: packed (epoch, counter) transaction identifier
//! - [`PeerStatus`]: a peer's role as advertised in election votes
//! - [`OpCode`]: the mutation kind carried by a proposal
//!
//! # Type Aliases
//!
//! - [`Fid`] = `String`: opaque, cluster-unique peer identity
//! - [`Epoch`] = `u32`: leader generation number
//! - [`ReqId`] = `u64`: client request identifier

use crate::error::{CairnError, Result};
use serde::{Deserialize, Serialize};

/// Opaque peer identity, stable for a process's lifetime and unique
/// across the cluster.
pub type Fid = String;

/// Leader generation number.
pub type Epoch = u32;

/// Client request identifier, scoped to the originating peer.
pub type ReqId = u64;

/// Transaction identifier for a proposal.
///
/// The top 32 bits hold the epoch of the leader that minted the id; the
/// low 32 bits a per-epoch counter. Because the epoch occupies the high
/// bits, ordering on the packed `u64` is exactly the lexicographic
/// (epoch, counter) order: the epoch dominates across leader changes and
/// the counter orders proposals within one reign.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Txnid(pub u64);

impl Txnid {
    /// The bootstrap transaction id of an empty peer.
    pub const ZERO: Txnid = Txnid(0);

    /// Build a txnid from its epoch and counter halves.
    pub fn new(epoch: Epoch, counter: u32) -> Self {
        Txnid(((epoch as u64) << 32) | counter as u64)
    }

    /// The epoch of the leader that minted this id.
    pub fn epoch(&self) -> Epoch {
        (self.0 >> 32) as u32
    }

    /// The per-epoch counter.
    pub fn counter(&self) -> u32 {
        self.0 as u32
    }

    /// The next txnid within the same epoch.
    ///
    /// Exhausting the 32-bit counter is fatal for the current reign; the
    /// leader must resign and a new epoch be negotiated.
    pub fn next(&self) -> Result<Txnid> {
        if self.counter() == u32::MAX {
            return Err(CairnError::CounterOverflow(self.epoch()));
        }
        Ok(Txnid(self.0 + 1))
    }

    /// The first txnid of the given epoch.
    pub fn first_of_epoch(epoch: Epoch) -> Self {
        Txnid::new(epoch, 1)
    }
}

impl std::fmt::Display for Txnid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.epoch(), self.counter())
    }
}

/// A peer's role as advertised in election votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Actively electing; no leader known.
    Electing,
    /// Following an established leader.
    Following,
    /// Leading the current epoch.
    Leading,
    /// Non-voting observer of committed state.
    Watching,
}

impl PeerStatus {
    /// Wire encoding used inside vote datagrams.
    pub fn as_u32(&self) -> u32 {
        match self {
            PeerStatus::Electing => 0,
            PeerStatus::Following => 1,
            PeerStatus::Leading => 2,
            PeerStatus::Watching => 3,
        }
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(PeerStatus::Electing),
            1 => Ok(PeerStatus::Following),
            2 => Ok(PeerStatus::Leading),
            3 => Ok(PeerStatus::Watching),
            other => Err(CairnError::ProtocolViolation(format!(
                "unknown peer status {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Electing => write!(f, "Electing"),
            PeerStatus::Following => write!(f, "Following"),
            PeerStatus::Leading => write!(f, "Leading"),
            PeerStatus::Watching => write!(f, "Watching"),
        }
    }
}

/// The mutation kind carried by a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpCode {
    /// Store a value under a key.
    Set,
    /// Remove a key.
    Delete,
}

impl OpCode {
    pub fn as_u32(&self) -> u32 {
        match self {
            OpCode::Set => 1,
            OpCode::Delete => 2,
        }
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(OpCode::Set),
            2 => Ok(OpCode::Delete),
            other => Err(CairnError::ProtocolViolation(format!(
                "unknown opcode {}",
                other
            ))),
        }
    }
}
