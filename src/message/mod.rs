//! Wire message catalog and codec.
//!
//! Every message that crosses a pipe or an election datagram is one of the
//! [`Packet`] variants below. On the wire a packet is a bincode-encoded
//! `(name, body)` record: the type name selects the decoder, the body is the
//! bincode encoding of the variant's struct. The decode path doubles as the
//! packet registry.
//!
//! Every message carries a protocol version; a mismatched version on receive
//! is a hard error and the connection is dropped.

use crate::error::{CairnError, Result};
use crate::types::{Epoch, Fid, ReqId, Txnid};
use serde::{Deserialize, Serialize};

/// Version stamped into every outgoing message and required on receive.
pub const PROTOCOL_VERSION: u32 = 1;

/// A proposed mutation, broadcast by the leader to every follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub version: u32,
    pub txnid: Txnid,
    /// Fid of the peer that originated the client request.
    pub fid: Fid,
    pub reqid: ReqId,
    pub opcode: u32,
    pub key: String,
    pub content: Vec<u8>,
}

/// A follower's acknowledgement of a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub version: u32,
    pub txnid: Txnid,
    pub fid: Fid,
}

/// Leader's instruction to apply a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub version: u32,
    pub txnid: Txnid,
}

/// Failure notification for a client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub version: u32,
    pub fid: Fid,
    pub reqid: ReqId,
    pub error: String,
}

/// Completion notification for a client request. An empty `error`
/// signals success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub fid: Fid,
    pub reqid: ReqId,
    pub error: String,
}

/// An election ballot, exchanged over UDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub version: u32,
    pub round: u64,
    pub status: u32,
    pub epoch: Epoch,
    /// The candidate this vote endorses.
    pub candidate_id: Fid,
    pub candidate_logged_txnid: Txnid,
    pub candidate_committed_txnid: Txnid,
    /// A solicit vote requests a reply without being recorded.
    pub solicit: bool,
}

/// One log record streamed during synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub version: u32,
    pub txnid: Txnid,
    pub opcode: u32,
    pub key: String,
    pub content: Vec<u8>,
}

/// First handshake message from a connecting follower or watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerInfo {
    pub version: u32,
    pub accepted_epoch: Epoch,
    pub fid: Fid,
    /// Watchers report `false` and are never counted in quorums.
    pub voting: bool,
}

/// Leader's reply naming the negotiated epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub version: u32,
    pub accepted_epoch: Epoch,
}

/// Follower's acknowledgement of the negotiated epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochAck {
    pub version: u32,
    pub last_logged_txid: Txnid,
    pub current_epoch: Epoch,
}

/// Marks the end of log reconciliation and finalizes the new epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLeader {
    pub version: u32,
    pub current_epoch: Epoch,
}

/// Follower's acknowledgement of [`NewLeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLeaderAck {
    pub version: u32,
}

/// A client request, forwarded from the originating peer to the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub reqid: ReqId,
    pub opcode: u32,
    pub key: String,
    pub content: Vec<u8>,
}

/// The complete wire catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Proposal(Proposal),
    Accept(Accept),
    Commit(Commit),
    Abort(Abort),
    Response(Response),
    Vote(Vote),
    LogEntry(LogEntry),
    FollowerInfo(FollowerInfo),
    LeaderInfo(LeaderInfo),
    EpochAck(EpochAck),
    NewLeader(NewLeader),
    NewLeaderAck(NewLeaderAck),
    Request(Request),
}

/// On-wire envelope: the packet type name plus the serialized body.
#[derive(Serialize, Deserialize)]
struct Envelope {
    name: String,
    body: Vec<u8>,
}

impl Packet {
    /// The registry name of the packet type.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Proposal(_) => "Proposal",
            Packet::Accept(_) => "Accept",
            Packet::Commit(_) => "Commit",
            Packet::Abort(_) => "Abort",
            Packet::Response(_) => "Response",
            Packet::Vote(_) => "Vote",
            Packet::LogEntry(_) => "LogEntry",
            Packet::FollowerInfo(_) => "FollowerInfo",
            Packet::LeaderInfo(_) => "LeaderInfo",
            Packet::EpochAck(_) => "EpochAck",
            Packet::NewLeader(_) => "NewLeader",
            Packet::NewLeaderAck(_) => "NewLeaderAck",
            Packet::Request(_) => "Request",
        }
    }

    /// The protocol version the packet carries.
    pub fn version(&self) -> u32 {
        match self {
            Packet::Proposal(m) => m.version,
            Packet::Accept(m) => m.version,
            Packet::Commit(m) => m.version,
            Packet::Abort(m) => m.version,
            Packet::Response(m) => m.version,
            Packet::Vote(m) => m.version,
            Packet::LogEntry(m) => m.version,
            Packet::FollowerInfo(m) => m.version,
            Packet::LeaderInfo(m) => m.version,
            Packet::EpochAck(m) => m.version,
            Packet::NewLeader(m) => m.version,
            Packet::NewLeaderAck(m) => m.version,
            Packet::Request(m) => m.version,
        }
    }

    /// Encode the packet into its framed wire representation (without the
    /// length prefix, which the transport owns).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Packet::Proposal(m) => bincode::serialize(m),
            Packet::Accept(m) => bincode::serialize(m),
            Packet::Commit(m) => bincode::serialize(m),
            Packet::Abort(m) => bincode::serialize(m),
            Packet::Response(m) => bincode::serialize(m),
            Packet::Vote(m) => bincode::serialize(m),
            Packet::LogEntry(m) => bincode::serialize(m),
            Packet::FollowerInfo(m) => bincode::serialize(m),
            Packet::LeaderInfo(m) => bincode::serialize(m),
            Packet::EpochAck(m) => bincode::serialize(m),
            Packet::NewLeader(m) => bincode::serialize(m),
            Packet::NewLeaderAck(m) => bincode::serialize(m),
            Packet::Request(m) => bincode::serialize(m),
        }?;
        let envelope = Envelope {
            name: self.name().to_string(),
            body,
        };
        Ok(bincode::serialize(&envelope)?)
    }

    /// Decode a framed wire record into a packet.
    ///
    /// Unknown names and version mismatches are hard errors; the caller is
    /// expected to drop the connection.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        let envelope: Envelope = bincode::deserialize(bytes)?;
        let body = envelope.body.as_slice();
        let packet = match envelope.name.as_str() {
            "Proposal" => Packet::Proposal(bincode::deserialize(body)?),
            "Accept" => Packet::Accept(bincode::deserialize(body)?),
            "Commit" => Packet::Commit(bincode::deserialize(body)?),
            "Abort" => Packet::Abort(bincode::deserialize(body)?),
            "Response" => Packet::Response(bincode::deserialize(body)?),
            "Vote" => Packet::Vote(bincode::deserialize(body)?),
            "LogEntry" => Packet::LogEntry(bincode::deserialize(body)?),
            "FollowerInfo" => Packet::FollowerInfo(bincode::deserialize(body)?),
            "LeaderInfo" => Packet::LeaderInfo(bincode::deserialize(body)?),
            "EpochAck" => Packet::EpochAck(bincode::deserialize(body)?),
            "NewLeader" => Packet::NewLeader(bincode::deserialize(body)?),
            "NewLeaderAck" => Packet::NewLeaderAck(bincode::deserialize(body)?),
            "Request" => Packet::Request(bincode::deserialize(body)?),
            other => {
                return Err(CairnError::ProtocolViolation(format!(
                    "unknown packet type {:?}",
                    other
                )))
            }
        };

        if packet.version() != PROTOCOL_VERSION {
            return Err(CairnError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: packet.version(),
            });
        }
        Ok(packet)
    }
}

/// Constructors stamping the current protocol version, mirroring the shape
/// of the messages a peer sends in each protocol phase.
pub mod factory {
    use super::*;
    use crate::types::{OpCode, PeerStatus};

    pub fn proposal(
        txnid: Txnid,
        fid: &str,
        reqid: ReqId,
        opcode: OpCode,
        key: &str,
        content: Vec<u8>,
    ) -> Packet {
        Packet::Proposal(Proposal {
            version: PROTOCOL_VERSION,
            txnid,
            fid: fid.to_string(),
            reqid,
            opcode: opcode.as_u32(),
            key: key.to_string(),
            content,
        })
    }

    pub fn accept(txnid: Txnid, fid: &str) -> Packet {
        Packet::Accept(Accept {
            version: PROTOCOL_VERSION,
            txnid,
            fid: fid.to_string(),
        })
    }

    pub fn commit(txnid: Txnid) -> Packet {
        Packet::Commit(Commit {
            version: PROTOCOL_VERSION,
            txnid,
        })
    }

    pub fn abort(fid: &str, reqid: ReqId, error: &str) -> Packet {
        Packet::Abort(Abort {
            version: PROTOCOL_VERSION,
            fid: fid.to_string(),
            reqid,
            error: error.to_string(),
        })
    }

    pub fn response(fid: &str, reqid: ReqId, error: &str) -> Packet {
        Packet::Response(Response {
            version: PROTOCOL_VERSION,
            fid: fid.to_string(),
            reqid,
            error: error.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn vote(
        round: u64,
        status: PeerStatus,
        epoch: Epoch,
        candidate_id: &str,
        logged: Txnid,
        committed: Txnid,
        solicit: bool,
    ) -> Packet {
        Packet::Vote(Vote {
            version: PROTOCOL_VERSION,
            round,
            status: status.as_u32(),
            epoch,
            candidate_id: candidate_id.to_string(),
            candidate_logged_txnid: logged,
            candidate_committed_txnid: committed,
            solicit,
        })
    }

    pub fn log_entry(txnid: Txnid, opcode: u32, key: &str, content: Vec<u8>) -> Packet {
        Packet::LogEntry(LogEntry {
            version: PROTOCOL_VERSION,
            txnid,
            opcode,
            key: key.to_string(),
            content,
        })
    }

    pub fn follower_info(accepted_epoch: Epoch, fid: &str, voting: bool) -> Packet {
        Packet::FollowerInfo(FollowerInfo {
            version: PROTOCOL_VERSION,
            accepted_epoch,
            fid: fid.to_string(),
            voting,
        })
    }

    pub fn leader_info(accepted_epoch: Epoch) -> Packet {
        Packet::LeaderInfo(LeaderInfo {
            version: PROTOCOL_VERSION,
            accepted_epoch,
        })
    }

    pub fn epoch_ack(last_logged_txid: Txnid, current_epoch: Epoch) -> Packet {
        Packet::EpochAck(EpochAck {
            version: PROTOCOL_VERSION,
            last_logged_txid,
            current_epoch,
        })
    }

    pub fn new_leader(current_epoch: Epoch) -> Packet {
        Packet::NewLeader(NewLeader {
            version: PROTOCOL_VERSION,
            current_epoch,
        })
    }

    pub fn new_leader_ack() -> Packet {
        Packet::NewLeaderAck(NewLeaderAck {
            version: PROTOCOL_VERSION,
        })
    }

    pub fn request(reqid: ReqId, opcode: OpCode, key: &str, content: Vec<u8>) -> Packet {
        Packet::Request(Request {
            version: PROTOCOL_VERSION,
            reqid,
            opcode: opcode.as_u32(),
            key: key.to_string(),
            content,
        })
    }
}
