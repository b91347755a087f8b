//! Consensus core for the Cairn metadata store.
//!
//! This module implements the leader-based replication protocol: leader
//! election over UDP, epoch negotiation and log reconciliation on freshly
//! connected pipes, the steady-state proposal/accept/commit pipeline, and
//! the watcher supervision loop that glues client requests into the
//! replication stream.
//!
//! Control flow: watcher server → (optional) election site → sync proxy →
//! follower/leader actor → observer. A client mutation flows from the
//! request manager over a pipe to the leader, is proposed to every
//! follower, accepted by a quorum, committed everywhere, and answered on
//! the originating pipe.

pub mod election;
pub mod follower;
pub mod leader;
pub mod observer;
pub mod request;
pub mod server;
pub mod sync;
pub mod watcher;

pub use election::ElectionSite;
pub use follower::{Follower, FollowerHandle};
pub use leader::run_leader_server;
pub use observer::Observer;
pub use request::ClientRequestMgr;
pub use server::run_peer_server;
pub use sync::{EpochNegotiator, FollowerSyncProxy, LeaderSyncProxy};
pub use watcher::{
    run_watcher_server, run_watcher_server_with_election, run_watcher_server_with_request,
};

use crate::error::Result;
use crate::message::{LogEntry, Proposal, Request};
use crate::types::{Epoch, Fid, ReqId, Txnid};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;

/// Maximum number of voting peers.
pub const MAX_VOTERS: usize = 50;
/// Maximum number of followers.
pub const MAX_FOLLOWERS: usize = 100;
/// Maximum number of peers of any kind.
pub const MAX_PEERS: usize = 150;
/// Maximum number of in-flight proposals; also the observer queue bound.
pub const MAX_PROPOSALS: usize = 1000;
/// Maximum size of an election datagram.
pub const MAX_DATAGRAM_SIZE: usize = 1000;

/// Default TCP port for protocol messages.
pub const MESSAGE_PORT: u16 = 9999;
/// Default UDP port for election votes.
pub const ELECTION_PORT: u16 = 9998;
/// Keep-alive period applied to every message socket.
pub const TCP_KEEP_ALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Initial per-round ballot timeout.
pub const BALLOT_TIMEOUT: Duration = Duration::from_millis(50);
/// Ceiling for the doubling ballot timeout.
pub const BALLOT_MAX_TIMEOUT: Duration = Duration::from_millis(500);
/// Quiet period required after a quorum agrees before the ballot closes.
pub const BALLOT_FINALIZE_WAIT: Duration = Duration::from_millis(200);

/// Timeout for each synchronization step and for follower inactivity.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a leader tolerates losing quorum contact before resigning.
pub const LEADER_TIMEOUT: Duration = Duration::from_secs(100);

/// Initial supervisor retry backoff.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling for the doubling supervisor retry backoff.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// The strict majority of a voting set.
pub fn quorum(ensemble_size: u64) -> usize {
    ensemble_size as usize / 2 + 1
}

/// Role a protocol actor plays after synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Voting peer consuming proposals and commits.
    Follower,
    /// Non-voting peer consuming proposals and commits.
    Watcher,
    /// The elected leader.
    Leader,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Follower => write!(f, "Follower"),
            PeerRole::Watcher => write!(f, "Watcher"),
            PeerRole::Leader => write!(f, "Leader"),
        }
    }
}

/// Persistence and application callbacks consumed by the protocol actors.
///
/// Implementations serialize their own internal state; the protocol calls
/// these methods from multiple tasks.
pub trait ActionHandler: Send + Sync {
    /// Highest txnid present in the log.
    fn last_logged_txid(&self) -> Result<Txnid>;
    /// Highest txnid whose effects are durable in the application state.
    fn last_committed_txid(&self) -> Result<Txnid>;

    /// Highest epoch whose leader this peer has acknowledged.
    fn accepted_epoch(&self) -> Result<Epoch>;
    fn set_accepted_epoch(&self, epoch: Epoch) -> Result<()>;

    /// Epoch whose NEW-LEADER this peer has finalized. Always at most the
    /// accepted epoch.
    fn current_epoch(&self) -> Result<Epoch>;
    fn set_current_epoch(&self, epoch: Epoch) -> Result<()>;

    /// Append a proposal to the log. Re-logging an already-present txnid
    /// with identical payload is a no-op; a differing payload is an error.
    fn log_proposal(&self, proposal: &Proposal) -> Result<()>;

    /// Read the log suffix strictly after the given txnid, in order.
    fn log_entries_after(&self, txnid: Txnid) -> Result<Vec<LogEntry>>;

    /// Apply a logged proposal and advance the committed txnid.
    fn commit(&self, txnid: Txnid) -> Result<()>;

    /// Notify the request manager that a request failed.
    fn abort(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()>;
    /// Notify the request manager that a request completed.
    fn respond(&self, fid: &Fid, reqid: ReqId, error: &str) -> Result<()>;

    /// This peer's identity.
    fn follower_id(&self) -> Fid;
    /// Size of the voting set this peer belongs to.
    fn ensemble_size(&self) -> u64;
}

/// A client request waiting for consensus, carrying its completion slot.
pub struct RequestHandle {
    pub request: Request,
    /// Completed with `Ok(())` on commit or `Err(msg)` on abort. `None`
    /// for fire-and-forget requests.
    pub completion: Option<oneshot::Sender<std::result::Result<(), String>>>,
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("reqid", &self.request.reqid)
            .field("key", &self.request.key)
            .finish()
    }
}

/// Source of locally-originated client requests.
#[async_trait]
pub trait RequestMgr: Send + Sync {
    /// Await the next incoming request. `None` means the client side shut
    /// down and the consumer should terminate.
    async fn next_request(&self) -> Option<RequestHandle>;

    /// Park a request until its response or abort arrives.
    fn add_pending_request(&self, handle: RequestHandle);

    /// Fail all parked requests; called when the serving peer is lost.
    fn cleanup_on_error(&self);
}

/// Doubling retry backoff with a ceiling.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: RETRY_BACKOFF,
            max: MAX_RETRY_BACKOFF,
        }
    }

    /// The next sleep duration. Doubles on each call up to the ceiling.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
