//! Steady-state leader actor and the leader server loop.
//!
//! The leader server owns the message listener. Every incoming connection
//! runs a leader-side sync proxy against the reign's shared
//! [`EpochNegotiator`]; a synced pipe is registered with the leader actor
//! together with a reader task that drains it through a per-peer observer
//! into the actor's event channel.
//!
//! The actor owns all consensus state: the txnid counter, the pending
//! proposal map, and the set of connected peers. It never shares that
//! state; everything reaches it as an event.

use super::{
    quorum, ActionHandler, EpochNegotiator, LeaderSyncProxy, Observer, RequestHandle, RequestMgr,
    LEADER_TIMEOUT, MAX_PROPOSALS,
};
use crate::config::PeerEndpoint;
use crate::error::{CairnError, Result};
use crate::message::{factory, Packet, Proposal, PROTOCOL_VERSION};
use crate::net::PeerPipe;
use crate::shutdown::Kill;
use crate::types::{Fid, Txnid};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events feeding the leader actor.
enum LeaderEvent {
    PeerJoined {
        fid: Fid,
        voting: bool,
        pipe: Arc<PeerPipe>,
    },
    PeerLost {
        fid: Fid,
    },
    PacketFrom {
        fid: Fid,
        packet: Packet,
    },
    LocalRequest(RequestHandle),
}

/// A proposal awaiting its quorum.
struct PendingProposal {
    proposal: Proposal,
    accepts: HashSet<Fid>,
    committed: bool,
    completion: Option<tokio::sync::oneshot::Sender<std::result::Result<(), String>>>,
}

struct PeerState {
    pipe: Arc<PeerPipe>,
    voting: bool,
}

struct Leader {
    fid: Fid,
    handler: Arc<dyn ActionHandler>,
    next_txnid: Txnid,
    quorum: usize,
    peers: HashMap<Fid, PeerState>,
    pending: BTreeMap<Txnid, PendingProposal>,
    last_quorum_contact: Instant,
}

impl Leader {
    fn new(handler: Arc<dyn ActionHandler>, epoch: u32) -> Self {
        let fid = handler.follower_id();
        let quorum = quorum(handler.ensemble_size());
        Self {
            fid,
            handler,
            next_txnid: Txnid::first_of_epoch(epoch),
            quorum,
            peers: HashMap::new(),
            pending: BTreeMap::new(),
            last_quorum_contact: Instant::now(),
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<LeaderEvent>, kill: Kill) -> Result<()> {
        info!(fid = %self.fid, epoch = self.next_txnid.epoch(), "leader actor started");
        let mut contact_check = tokio::time::interval(LEADER_TIMEOUT / 100);
        contact_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = kill.killed() => return Ok(()),
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => return Ok(()),
                    }
                }
                _ = contact_check.tick() => {
                    if self.quorum_contact_lost() {
                        warn!(fid = %self.fid, "quorum contact lost, resigning");
                        return Err(CairnError::QuorumLost);
                    }
                }
            }
        }
    }

    /// A leader alone in a quorum of one is always in contact with itself.
    /// Dead connections are policed by TCP keep-alive, so a connected
    /// voting quorum counts as live contact.
    fn quorum_contact_lost(&mut self) -> bool {
        if self.quorum <= 1 {
            return false;
        }
        let voting_connected = 1 + self.peers.values().filter(|p| p.voting).count();
        if voting_connected >= self.quorum {
            self.last_quorum_contact = Instant::now();
            false
        } else {
            self.last_quorum_contact.elapsed() > LEADER_TIMEOUT
        }
    }

    async fn handle_event(&mut self, event: LeaderEvent) -> Result<()> {
        match event {
            LeaderEvent::PeerJoined { fid, voting, pipe } => {
                info!(peer = %fid, voting, "peer joined leader");
                self.peers.insert(fid, PeerState { pipe, voting });
                self.touch_quorum_contact();
            }
            LeaderEvent::PeerLost { fid } => {
                info!(peer = %fid, "peer lost");
                self.peers.remove(&fid);
            }
            LeaderEvent::PacketFrom { fid, packet } => {
                if self.peers.get(&fid).map(|p| p.voting).unwrap_or(false) {
                    self.touch_quorum_contact();
                }
                self.handle_packet(fid, packet).await?;
            }
            LeaderEvent::LocalRequest(handle) => {
                let origin = self.fid.clone();
                self.propose(origin, handle.request, handle.completion)
                    .await?;
            }
        }
        Ok(())
    }

    fn touch_quorum_contact(&mut self) {
        let voting_connected = 1 + self.peers.values().filter(|p| p.voting).count();
        if voting_connected >= self.quorum {
            self.last_quorum_contact = Instant::now();
        }
    }

    async fn handle_packet(&mut self, from: Fid, packet: Packet) -> Result<()> {
        match packet {
            Packet::Request(request) => {
                self.propose(from, request, None).await?;
            }
            Packet::Accept(accept) => {
                let voting = self.peers.get(&accept.fid).map(|p| p.voting).unwrap_or(false);
                if !voting {
                    // Watcher accepts carry no quorum weight.
                    debug!(peer = %accept.fid, txnid = %accept.txnid, "ignoring non-voting accept");
                    return Ok(());
                }
                if let Some(pending) = self.pending.get_mut(&accept.txnid) {
                    pending.accepts.insert(accept.fid);
                    self.maybe_commit(accept.txnid).await?;
                } else {
                    debug!(txnid = %accept.txnid, "accept for unknown or settled proposal");
                }
            }
            other => {
                // Followers forward client requests, never proposals or
                // anything else. Drop the offending peer.
                warn!(peer = %from, packet = other.name(), "protocol violation on follower pipe");
                if let Some(peer) = self.peers.remove(&from) {
                    peer.pipe.close();
                }
            }
        }
        Ok(())
    }

    async fn propose(
        &mut self,
        origin: Fid,
        request: crate::message::Request,
        completion: Option<tokio::sync::oneshot::Sender<std::result::Result<(), String>>>,
    ) -> Result<()> {
        if self.pending.len() >= MAX_PROPOSALS {
            let msg = "too many in-flight proposals";
            self.deliver_abort(&origin, request.reqid, msg, completion)
                .await;
            return Ok(());
        }

        let txnid = self.next_txnid;
        // Counter exhaustion ends the reign.
        self.next_txnid = self.next_txnid.next()?;

        let proposal = Proposal {
            version: PROTOCOL_VERSION,
            txnid,
            fid: origin.clone(),
            reqid: request.reqid,
            opcode: request.opcode,
            key: request.key,
            content: request.content,
        };

        if let Err(e) = self.handler.log_proposal(&proposal) {
            warn!(txnid = %txnid, error = %e, "leader failed to log proposal");
            self.deliver_abort(&origin, proposal.reqid, &e.to_string(), completion)
                .await;
            return Ok(());
        }

        debug!(txnid = %txnid, origin = %origin, key = %proposal.key, "proposal issued");

        // The leader accepts its own proposal.
        let mut accepts = HashSet::new();
        accepts.insert(self.fid.clone());

        self.pending.insert(
            txnid,
            PendingProposal {
                proposal: proposal.clone(),
                accepts,
                committed: false,
                completion,
            },
        );

        self.broadcast(Packet::Proposal(proposal)).await;
        self.maybe_commit(txnid).await?;
        Ok(())
    }

    async fn maybe_commit(&mut self, txnid: Txnid) -> Result<()> {
        let (origin, reqid) = match self.pending.get_mut(&txnid) {
            Some(p) if !p.committed && p.accepts.len() >= self.quorum => {
                p.committed = true;
                (p.proposal.fid.clone(), p.proposal.reqid)
            }
            _ => return Ok(()),
        };

        if let Err(e) = self.handler.commit(txnid) {
            // The log and the applied state can no longer converge under
            // this reign; abort the client and resign.
            warn!(txnid = %txnid, error = %e, "leader failed to commit");
            let completion = self.pending.remove(&txnid).and_then(|p| p.completion);
            self.deliver_abort(&origin, reqid, &e.to_string(), completion)
                .await;
            return Err(e);
        }

        info!(txnid = %txnid, "proposal committed");
        self.broadcast(factory::commit(txnid)).await;

        let completion = self.pending.remove(&txnid).and_then(|p| p.completion);
        self.deliver_response(&origin, reqid, completion).await;
        Ok(())
    }

    async fn deliver_response(
        &mut self,
        origin: &Fid,
        reqid: u64,
        completion: Option<tokio::sync::oneshot::Sender<std::result::Result<(), String>>>,
    ) {
        if let Some(tx) = completion {
            let _ = tx.send(Ok(()));
        }
        if *origin == self.fid {
            if let Err(e) = self.handler.respond(origin, reqid, "") {
                warn!(error = %e, "local response delivery failed");
            }
        } else if let Some(peer) = self.peers.get(origin) {
            if !peer.pipe.send(factory::response(origin, reqid, "")).await {
                warn!(peer = %origin, "response delivery failed, pipe gone");
            }
        }
    }

    async fn deliver_abort(
        &mut self,
        origin: &Fid,
        reqid: u64,
        error: &str,
        completion: Option<tokio::sync::oneshot::Sender<std::result::Result<(), String>>>,
    ) {
        if let Some(tx) = completion {
            let _ = tx.send(Err(error.to_string()));
        }
        if *origin == self.fid {
            if let Err(e) = self.handler.abort(origin, reqid, error) {
                warn!(error = %e, "local abort delivery failed");
            }
        } else if let Some(peer) = self.peers.get(origin) {
            if !peer.pipe.send(factory::abort(origin, reqid, error)).await {
                warn!(peer = %origin, "abort delivery failed, pipe gone");
            }
        }
    }

    async fn broadcast(&mut self, packet: Packet) {
        let mut lost = Vec::new();
        for (fid, peer) in &self.peers {
            if !peer.pipe.send(packet.clone()).await {
                lost.push(fid.clone());
            }
        }
        for fid in lost {
            warn!(peer = %fid, "broadcast failed, dropping peer");
            self.peers.remove(&fid);
        }
    }
}

/// Run the leader side of the protocol: listen for follower and watcher
/// connections, synchronize each, and drive the steady-state actor.
///
/// Returns when killed (Ok) or when the leader resigns (Err); the caller
/// re-enters election on error.
pub async fn run_leader_server(
    endpoint: &PeerEndpoint,
    handler: Arc<dyn ActionHandler>,
    request_mgr: Option<Arc<dyn RequestMgr>>,
    kill: Kill,
) -> Result<()> {
    let fid = handler.follower_id();
    let ensemble = handler.ensemble_size();
    let negotiator = Arc::new(EpochNegotiator::new(quorum(ensemble)));

    let listener = TcpListener::bind(&endpoint.message_addr)
        .await
        .map_err(|e| CairnError::ConnectionFailed(format!("{}: {}", endpoint.message_addr, e)))?;
    info!(fid = %fid, addr = %endpoint.message_addr, "leader server listening");

    // Everything spawned below dies with this scope. The bridge dies with
    // the scope so repeated terms don't leak tasks.
    let scope = Kill::new();
    {
        let parent = kill.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.killed() => scope.kill(),
                _ = scope.killed() => {}
            }
        });
    }

    let (event_tx, event_rx) = mpsc::channel::<LeaderEvent>(MAX_PROPOSALS);

    // Accept loop.
    {
        let handler = Arc::clone(&handler);
        let negotiator = Arc::clone(&negotiator);
        let event_tx = event_tx.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.killed() => return,
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(a) => a,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        debug!(peer = %peer_addr, "incoming connection");
                        let handler = Arc::clone(&handler);
                        let negotiator = Arc::clone(&negotiator);
                        let event_tx = event_tx.clone();
                        let scope = scope.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, handler, negotiator, event_tx, scope).await;
                        });
                    }
                }
            }
        });
    }

    // The leader reports its own epoch and ack, then waits for the reign
    // to be established by a quorum.
    let established = tokio::select! {
        _ = scope.killed() => {
            return Ok(());
        }
        result = tokio::time::timeout(LEADER_TIMEOUT, async {
            let epoch = negotiator
                .negotiate(&fid, handler.accepted_epoch()?, true)
                .await?;
            handler.set_accepted_epoch(epoch)?;
            negotiator.record_ack(&fid, true);
            negotiator.quorum_acked().await;
            handler.set_current_epoch(epoch)?;
            Ok::<u32, CairnError>(epoch)
        }) => {
            match result {
                Ok(Ok(epoch)) => epoch,
                Ok(Err(e)) => {
                    scope.kill();
                    return Err(e);
                }
                Err(_) => {
                    scope.kill();
                    warn!(fid = %fid, "no quorum synchronized in time, resigning");
                    return Err(CairnError::QuorumLost);
                }
            }
        }
    };

    // Local request pump.
    if let Some(mgr) = request_mgr {
        let event_tx = event_tx.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.killed() => return,
                    request = mgr.next_request() => {
                        match request {
                            Some(handle) => {
                                mgr.add_pending_request(RequestHandle {
                                    request: handle.request.clone(),
                                    completion: None,
                                });
                                if event_tx.send(LeaderEvent::LocalRequest(handle)).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });
    }

    let leader = Leader::new(Arc::clone(&handler), established);
    let result = leader.run(event_rx, scope.clone()).await;
    scope.kill();
    result
}

/// Synchronize one incoming connection and, on success, wire it into the
/// leader actor.
async fn serve_connection(
    stream: tokio::net::TcpStream,
    handler: Arc<dyn ActionHandler>,
    negotiator: Arc<EpochNegotiator>,
    event_tx: mpsc::Sender<LeaderEvent>,
    scope: Kill,
) {
    let pipe = match PeerPipe::new(stream) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            warn!(error = %e, "failed to wrap connection");
            return;
        }
    };

    let proxy = LeaderSyncProxy::new(Arc::clone(&pipe), handler, negotiator);
    let synced = tokio::select! {
        _ = scope.killed() => {
            pipe.close();
            return;
        }
        result = proxy.run() => match result {
            Ok(synced) => synced,
            Err(e) => {
                warn!(peer = %pipe.addr(), error = %e, "leader-side sync failed");
                pipe.close();
                return;
            }
        }
    };

    if event_tx
        .send(LeaderEvent::PeerJoined {
            fid: synced.fid.clone(),
            voting: synced.voting,
            pipe: Arc::clone(&pipe),
        })
        .await
        .is_err()
    {
        pipe.close();
        return;
    }

    // Reader: pipe through the per-peer observer into the actor.
    let observer = Arc::new(Observer::new());
    let conn_kill = Kill::new();
    {
        let pipe = Arc::clone(&pipe);
        let observer = Arc::clone(&observer);
        let conn_kill = conn_kill.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = scope.killed() => break,
                    packet = pipe.receive() => match packet {
                        Some(packet) => observer.send(packet),
                        None => break,
                    }
                }
            }
            conn_kill.kill();
        });
    }

    // Forwarder: observer into the actor's event channel.
    let fid = synced.fid;
    loop {
        tokio::select! {
            _ = conn_kill.killed() => break,
            _ = scope.killed() => break,
            packet = observer.next() => {
                if event_tx
                    .send(LeaderEvent::PacketFrom { fid: fid.clone(), packet })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    let _ = event_tx.send(LeaderEvent::PeerLost { fid }).await;
    pipe.close();
}
