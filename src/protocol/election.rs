//! Leader election over UDP.
//!
//! Each peer runs an [`ElectionSite`] bound to its election endpoint. A
//! ballot broadcasts a vote for the best candidate this peer knows of and
//! tallies the votes of the others; when a strict majority of the voting
//! set agrees on one candidate and no contradicting vote arrives within
//! the finalize window, that candidate is the winner. Round timeouts start
//! at [`BALLOT_TIMEOUT`](super::BALLOT_TIMEOUT) and double up to
//! [`BALLOT_MAX_TIMEOUT`](super::BALLOT_MAX_TIMEOUT) on inconclusive
//! rounds.
//!
//! Candidates are compared on `(epoch, committed txnid, logged txnid, id)`
//! in that order, so the peer with the most durable history wins and the
//! highest identity breaks exact ties.
//!
//! The winner is emitted exactly once; the site then keeps answering
//! incoming votes and solicit probes with its final vote until closed, so
//! watchers and late joiners can still discover the leader.

use super::{
    ActionHandler, BALLOT_FINALIZE_WAIT, BALLOT_MAX_TIMEOUT, BALLOT_TIMEOUT, MAX_DATAGRAM_SIZE,
    quorum,
};
use crate::config::PeerEndpoint;
use crate::error::{CairnError, Result};
use crate::message::{factory, Packet, Vote};
use crate::shutdown::Kill;
use crate::types::{Epoch, Fid, PeerStatus, Txnid};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The tuple a vote endorses. Comparison is lexicographic on
/// (epoch, committed, logged, id).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    epoch: Epoch,
    committed: Txnid,
    logged: Txnid,
    id: Fid,
}

impl Candidate {
    fn from_vote(vote: &Vote) -> Self {
        Self {
            epoch: vote.epoch,
            committed: vote.candidate_committed_txnid,
            logged: vote.candidate_logged_txnid,
            id: vote.candidate_id.clone(),
        }
    }

    fn beats(&self, other: &Candidate) -> bool {
        (self.epoch, self.committed, self.logged, &self.id)
            > (other.epoch, other.committed, other.logged, &other.id)
    }
}

/// One peer's election endpoint, vote exchange, and ballot state.
pub struct ElectionSite {
    fid: Fid,
    socket: Arc<UdpSocket>,
    peers: Vec<PeerEndpoint>,
    handler: Arc<dyn ActionHandler>,
    solicit_only: bool,
    kill: Kill,
    started: AtomicBool,
}

impl ElectionSite {
    /// Bind the election socket for `host`. `solicit_only` sites (watchers)
    /// probe without ever being counted in the voting set.
    pub async fn new(
        host: &PeerEndpoint,
        peers: Vec<PeerEndpoint>,
        handler: Arc<dyn ActionHandler>,
        solicit_only: bool,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(&host.election_addr)
            .await
            .map_err(|e| CairnError::ConnectionFailed(format!("{}: {}", host.election_addr, e)))?;

        Ok(Self {
            fid: host.fid.clone(),
            socket: Arc::new(socket),
            peers,
            handler,
            solicit_only,
            kill: Kill::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Start the ballot. Returns the winner channel, or `None` if the site
    /// already ran or was closed. The channel closing without a value means
    /// the election was inconclusive.
    pub fn start_election(&self) -> Option<oneshot::Receiver<PeerEndpoint>> {
        if self.kill.is_killed() || self.started.swap(true, Ordering::SeqCst) {
            return None;
        }

        let (result_tx, result_rx) = oneshot::channel();

        let ballot = match Ballot::new(self) {
            Ok(b) => b,
            Err(e) => {
                warn!(fid = %self.fid, error = %e, "failed to start ballot");
                return None;
            }
        };
        let kill = self.kill.clone();
        tokio::spawn(async move { ballot.run(result_tx, kill).await });

        Some(result_rx)
    }

    /// Close the site. The ballot task terminates and the socket is
    /// released.
    pub fn close(&self) {
        self.kill.kill();
    }
}

impl Drop for ElectionSite {
    fn drop(&mut self) {
        self.close();
    }
}

struct Ballot {
    fid: Fid,
    socket: Arc<UdpSocket>,
    peers: Vec<PeerEndpoint>,
    /// Sender resolution: source address of a datagram to peer identity.
    senders: HashMap<SocketAddr, Fid>,
    voting_set: Vec<Fid>,
    solicit_only: bool,
    round: u64,
    status: PeerStatus,
    current: Candidate,
    /// A solicit-only site starts with its own stats as a placeholder,
    /// not a real candidacy; the first recorded vote replaces it
    /// unconditionally.
    provisional: bool,
    tally: HashMap<Fid, Candidate>,
}

impl Ballot {
    fn new(site: &ElectionSite) -> Result<Self> {
        let mut senders = HashMap::new();
        for peer in &site.peers {
            let addr: SocketAddr = peer.election_addr.parse().map_err(|e| {
                CairnError::Config(format!(
                    "bad election address {:?}: {}",
                    peer.election_addr, e
                ))
            })?;
            senders.insert(addr, peer.fid.clone());
        }
        let voting_set: Vec<Fid> = site
            .peers
            .iter()
            .filter(|p| p.voting)
            .map(|p| p.fid.clone())
            .collect();

        let current = Candidate {
            epoch: site.handler.current_epoch()?,
            committed: site.handler.last_committed_txid()?,
            logged: site.handler.last_logged_txid()?,
            id: site.fid.clone(),
        };

        let mut tally = HashMap::new();
        let status = if site.solicit_only {
            PeerStatus::Watching
        } else {
            // A voter's own ballot counts from the start.
            tally.insert(site.fid.clone(), current.clone());
            PeerStatus::Electing
        };

        Ok(Self {
            fid: site.fid.clone(),
            socket: Arc::clone(&site.socket),
            peers: site.peers.clone(),
            senders,
            voting_set,
            solicit_only: site.solicit_only,
            round: 1,
            status,
            current,
            provisional: site.solicit_only,
            tally,
        })
    }

    async fn run(mut self, result_tx: oneshot::Sender<PeerEndpoint>, kill: Kill) {
        info!(fid = %self.fid, candidate = %self.current.id, "election started");

        let mut timeout = BALLOT_TIMEOUT;
        let mut finalize_deadline: Option<Instant> = None;
        let mut buf = [0u8; 1500];

        self.broadcast_vote().await;

        loop {
            // Re-evaluate the quorum on every pass: a vote that breaks the
            // agreement re-opens the ballot, one that forms it starts the
            // finalize window.
            if !self.provisional
                && self.supporters() >= quorum(self.voting_set.len() as u64)
            {
                if finalize_deadline.is_none() {
                    finalize_deadline = Some(Instant::now() + BALLOT_FINALIZE_WAIT);
                }
            } else {
                finalize_deadline = None;
            }

            let wait = match finalize_deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };

            tokio::select! {
                _ = kill.killed() => {
                    debug!(fid = %self.fid, "election site killed");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(fid = %self.fid, error = %e, "election socket error");
                            continue;
                        }
                    };
                    let Some(vote) = self.decode_vote(&buf[..len]) else { continue };

                    if vote.solicit {
                        // Probes get a reply and never perturb the tally.
                        self.reply_vote(from).await;
                        continue;
                    }

                    let Some(sender) = self.senders.get(&from).cloned() else {
                        debug!(fid = %self.fid, from = %from, "vote from unknown sender");
                        continue;
                    };

                    let candidate = Candidate::from_vote(&vote);
                    self.tally.insert(sender, candidate.clone());

                    if self.provisional || candidate.beats(&self.current) {
                        self.provisional = false;
                        debug!(
                            fid = %self.fid,
                            adopted = %candidate.id,
                            epoch = candidate.epoch,
                            "adopting better candidate"
                        );
                        self.current = candidate;
                        if !self.solicit_only {
                            self.tally.insert(self.fid.clone(), self.current.clone());
                            self.broadcast_vote().await;
                        }
                        // Progress resets the round timeout.
                        timeout = BALLOT_TIMEOUT;
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    if finalize_deadline.is_some() {
                        // Quiet finalize window elapsed; the ballot closes.
                        break;
                    }
                    // Inconclusive round.
                    self.round += 1;
                    timeout = (timeout * 2).min(BALLOT_MAX_TIMEOUT);
                    self.broadcast_vote().await;
                }
            }
        }

        let winner = self.current.id.clone();
        self.status = if winner == self.fid {
            PeerStatus::Leading
        } else {
            PeerStatus::Following
        };
        info!(fid = %self.fid, leader = %winner, "election concluded");

        match self.peers.iter().find(|p| p.fid == winner) {
            Some(endpoint) => {
                let _ = result_tx.send(endpoint.clone());
            }
            None => {
                warn!(fid = %self.fid, leader = %winner, "no endpoint for elected peer");
                drop(result_tx);
            }
        }

        self.respond_until_killed(kill).await;
    }

    /// Post-ballot phase: keep answering votes and probes with the final
    /// vote so late joiners converge on the established leader.
    async fn respond_until_killed(self, kill: Kill) {
        let mut buf = [0u8; 1500];
        loop {
            tokio::select! {
                _ = kill.killed() => return,
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(fid = %self.fid, error = %e, "election socket error");
                            continue;
                        }
                    };
                    if self.decode_vote(&buf[..len]).is_some() {
                        self.reply_vote(from).await;
                    }
                }
            }
        }
    }

    /// Voting fids currently endorsing our candidate.
    fn supporters(&self) -> usize {
        self.voting_set
            .iter()
            .filter(|fid| {
                self.tally
                    .get(*fid)
                    .map(|c| c.id == self.current.id)
                    .unwrap_or(false)
            })
            .count()
    }

    fn decode_vote(&self, bytes: &[u8]) -> Option<Vote> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            warn!(fid = %self.fid, len = bytes.len(), "oversized election datagram");
            return None;
        }
        match Packet::decode(bytes) {
            Ok(Packet::Vote(vote)) => Some(vote),
            Ok(other) => {
                warn!(fid = %self.fid, packet = other.name(), "non-vote packet on election socket");
                None
            }
            Err(e) => {
                warn!(fid = %self.fid, error = %e, "undecodable election datagram");
                None
            }
        }
    }

    fn current_vote(&self) -> Packet {
        factory::vote(
            self.round,
            self.status,
            self.current.epoch,
            &self.current.id,
            self.current.logged,
            self.current.committed,
            self.solicit_only,
        )
    }

    async fn broadcast_vote(&self) {
        let packet = self.current_vote();
        let bytes = match packet.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(fid = %self.fid, error = %e, "vote encode failed");
                return;
            }
        };
        if bytes.len() > MAX_DATAGRAM_SIZE {
            warn!(fid = %self.fid, len = bytes.len(), "vote exceeds datagram bound");
            return;
        }

        let sends = self
            .peers
            .iter()
            .filter(|p| p.fid != self.fid)
            .map(|p| self.socket.send_to(&bytes, &p.election_addr));
        for result in futures::future::join_all(sends).await {
            if let Err(e) = result {
                debug!(fid = %self.fid, error = %e, "vote send failed");
            }
        }
    }

    async fn reply_vote(&self, to: SocketAddr) {
        // Replies are never solicit probes, whatever mode this site is in.
        let packet = factory::vote(
            self.round,
            self.status,
            self.current.epoch,
            &self.current.id,
            self.current.logged,
            self.current.committed,
            false,
        );
        match packet.encode() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    debug!(fid = %self.fid, to = %to, error = %e, "vote reply failed");
                }
            }
            Err(e) => warn!(fid = %self.fid, error = %e, "vote encode failed"),
        }
    }
}
