//! Epoch negotiation and log reconciliation on a freshly connected pipe.
//!
//! Both sides of a new connection run a short-lived sync proxy before any
//! steady-state traffic: the follower side announces its accepted epoch and
//! log position, the leader side answers with the negotiated epoch and
//! streams the missing log suffix, and the exchange finishes with
//! NEW-LEADER / NEW-LEADER-ACK. Every receive step is bounded by
//! [`SYNC_TIMEOUT`](super::SYNC_TIMEOUT).
//!
//! The new epoch is fixed once per leader reign by the [`EpochNegotiator`]:
//! each leader-side proxy reports its follower's accepted epoch, and when a
//! quorum of voters has reported, `max(reported) + 1` becomes the epoch for
//! every synchronization of the reign, late arrivals included.

use super::{ActionHandler, SYNC_TIMEOUT};
use crate::error::{CairnError, Result};
use crate::message::{factory, Packet, Proposal, PROTOCOL_VERSION};
use crate::net::PeerPipe;
use crate::shutdown::Kill;
use crate::types::{Epoch, Fid};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

/// Shared epoch agreement for one leader reign.
pub struct EpochNegotiator {
    quorum: usize,
    state: Mutex<NegotiatorState>,
    notify: Notify,
}

#[derive(Default)]
struct NegotiatorState {
    reported: HashMap<Fid, Epoch>,
    established: Option<Epoch>,
    acked: HashSet<Fid>,
}

impl EpochNegotiator {
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            state: Mutex::new(NegotiatorState::default()),
            notify: Notify::new(),
        }
    }

    /// Report a peer's accepted epoch and wait for the reign's epoch to be
    /// established. Non-voting peers never advance the quorum; they only
    /// wait.
    pub async fn negotiate(&self, fid: &Fid, accepted_epoch: Epoch, voting: bool) -> Result<Epoch> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before the state check; notify_waiters
            // only reaches already-registered waiters.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(epoch) = state.established {
                    return Ok(epoch);
                }
                if voting {
                    state.reported.insert(fid.clone(), accepted_epoch);
                    if state.reported.len() >= self.quorum {
                        let max = state.reported.values().copied().max().unwrap_or(0);
                        if max == Epoch::MAX {
                            return Err(CairnError::EpochOverflow(max));
                        }
                        let epoch = max + 1;
                        state.established = Some(epoch);
                        drop(state);
                        info!(epoch, "new epoch established");
                        self.notify.notify_waiters();
                        return Ok(epoch);
                    }
                }
            }
            notified.await;
        }
    }

    /// The established epoch, if the quorum already reported.
    pub fn established(&self) -> Option<Epoch> {
        self.state.lock().established
    }

    /// Record a NEW-LEADER-ACK from a synced peer.
    pub fn record_ack(&self, fid: &Fid, voting: bool) {
        if !voting {
            return;
        }
        let mut state = self.state.lock();
        state.acked.insert(fid.clone());
        if state.acked.len() >= self.quorum {
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Wait until a quorum of voters has acknowledged NEW-LEADER.
    pub async fn quorum_acked(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().acked.len() >= self.quorum {
                return;
            }
            notified.await;
        }
    }
}

/// Follower-side synchronization, used by followers and watchers alike.
pub struct FollowerSyncProxy {
    pipe: Arc<PeerPipe>,
    handler: Arc<dyn ActionHandler>,
    voting: bool,
}

impl FollowerSyncProxy {
    pub fn new(pipe: Arc<PeerPipe>, handler: Arc<dyn ActionHandler>, voting: bool) -> Self {
        Self {
            pipe,
            handler,
            voting,
        }
    }

    /// Run the handshake in a background task. The returned channel yields
    /// `true` once synchronization completes; a kill or any failure yields
    /// `false` (or closes the channel).
    pub fn start(self, kill: Kill) -> oneshot::Receiver<bool> {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = self.run() => {
                    match &result {
                        Ok(()) => debug!(peer = %self.pipe.addr(), "synchronization complete"),
                        Err(e) => warn!(peer = %self.pipe.addr(), error = %e, "synchronization failed"),
                    }
                    result.is_ok()
                }
                _ = kill.killed() => {
                    debug!(peer = %self.pipe.addr(), "synchronization killed");
                    false
                }
            };
            let _ = done_tx.send(outcome);
        });
        done_rx
    }

    async fn run(&self) -> Result<()> {
        let fid = self.handler.follower_id();
        let accepted = self.handler.accepted_epoch()?;

        if !self
            .pipe
            .send(factory::follower_info(accepted, &fid, self.voting))
            .await
        {
            return Err(CairnError::PipeClosed);
        }

        let new_epoch = match self.recv().await? {
            Packet::LeaderInfo(info) => {
                if info.accepted_epoch < accepted {
                    return Err(CairnError::StaleLeader {
                        offered: info.accepted_epoch,
                        accepted,
                    });
                }
                if info.accepted_epoch > accepted {
                    self.handler.set_accepted_epoch(info.accepted_epoch)?;
                }
                info.accepted_epoch
            }
            other => return Err(unexpected(&other, "LeaderInfo")),
        };

        let last_logged = self.handler.last_logged_txid()?;
        let current_epoch = self.handler.current_epoch()?;
        if !self
            .pipe
            .send(factory::epoch_ack(last_logged, current_epoch))
            .await
        {
            return Err(CairnError::PipeClosed);
        }

        // The leader streams its log suffix, interleaved with commits for
        // the durable prefix, and finishes with NEW-LEADER.
        loop {
            match self.recv().await? {
                Packet::LogEntry(entry) => {
                    let proposal = Proposal {
                        version: PROTOCOL_VERSION,
                        txnid: entry.txnid,
                        fid: String::new(),
                        reqid: 0,
                        opcode: entry.opcode,
                        key: entry.key,
                        content: entry.content,
                    };
                    self.handler.log_proposal(&proposal)?;
                }
                Packet::Commit(commit) => {
                    // A commit is a barrier: everything logged up to its
                    // txnid is durable on the leader and applies here, in
                    // order.
                    commit_through(&self.handler, commit.txnid)?;
                }
                Packet::NewLeader(new_leader) => {
                    if new_leader.current_epoch != new_epoch {
                        return Err(CairnError::ProtocolViolation(format!(
                            "NEW-LEADER epoch {} differs from negotiated {}",
                            new_leader.current_epoch, new_epoch
                        )));
                    }
                    self.handler.set_current_epoch(new_leader.current_epoch)?;
                    if !self.pipe.send(factory::new_leader_ack()).await {
                        return Err(CairnError::PipeClosed);
                    }
                    return Ok(());
                }
                other => return Err(unexpected(&other, "LogEntry, Commit or NewLeader")),
            }
        }
    }

    async fn recv(&self) -> Result<Packet> {
        tokio::time::timeout(SYNC_TIMEOUT, self.pipe.receive())
            .await
            .map_err(|_| CairnError::Timeout("sync"))?
            .ok_or(CairnError::PipeClosed)
    }
}

/// Identity of a successfully synchronized peer.
#[derive(Debug, Clone)]
pub struct SyncedFollower {
    pub fid: Fid,
    pub voting: bool,
}

/// Leader-side synchronization, run once per incoming connection.
pub struct LeaderSyncProxy {
    pipe: Arc<PeerPipe>,
    handler: Arc<dyn ActionHandler>,
    negotiator: Arc<EpochNegotiator>,
}

impl LeaderSyncProxy {
    pub fn new(
        pipe: Arc<PeerPipe>,
        handler: Arc<dyn ActionHandler>,
        negotiator: Arc<EpochNegotiator>,
    ) -> Self {
        Self {
            pipe,
            handler,
            negotiator,
        }
    }

    /// Run the handshake to completion, returning the synced peer's
    /// identity. The caller owns cancellation (kill or pipe close).
    pub async fn run(&self) -> Result<SyncedFollower> {
        let info = match self.recv().await? {
            Packet::FollowerInfo(info) => info,
            other => return Err(unexpected(&other, "FollowerInfo")),
        };

        let epoch = tokio::time::timeout(
            SYNC_TIMEOUT,
            self.negotiator
                .negotiate(&info.fid, info.accepted_epoch, info.voting),
        )
        .await
        .map_err(|_| CairnError::Timeout("epoch negotiation"))??;

        if !self.pipe.send(factory::leader_info(epoch)).await {
            return Err(CairnError::PipeClosed);
        }

        let ack = match self.recv().await? {
            Packet::EpochAck(ack) => ack,
            other => return Err(unexpected(&other, "EpochAck")),
        };

        // Stream everything the peer is missing, committing as far as our
        // own durable prefix goes. The peer may hold logged entries it
        // never saw committed; a catch-up commit covers that prefix first.
        let last_committed = self.handler.last_committed_txid()?;
        let catch_up = last_committed.min(ack.last_logged_txid);
        if catch_up > crate::types::Txnid::ZERO && !self.pipe.send(factory::commit(catch_up)).await
        {
            return Err(CairnError::PipeClosed);
        }
        let entries = self.handler.log_entries_after(ack.last_logged_txid)?;
        let count = entries.len();
        for entry in entries {
            let txnid = entry.txnid;
            if !self.pipe.send(Packet::LogEntry(entry)).await {
                return Err(CairnError::PipeClosed);
            }
            if txnid <= last_committed && !self.pipe.send(factory::commit(txnid)).await {
                return Err(CairnError::PipeClosed);
            }
        }
        debug!(
            peer = %info.fid,
            entries = count,
            from = %ack.last_logged_txid,
            "log suffix streamed"
        );

        if !self.pipe.send(factory::new_leader(epoch)).await {
            return Err(CairnError::PipeClosed);
        }

        match self.recv().await? {
            Packet::NewLeaderAck(_) => {}
            other => return Err(unexpected(&other, "NewLeaderAck")),
        }
        self.negotiator.record_ack(&info.fid, info.voting);

        info!(peer = %info.fid, voting = info.voting, epoch, "peer synchronized");
        Ok(SyncedFollower {
            fid: info.fid,
            voting: info.voting,
        })
    }

    async fn recv(&self) -> Result<Packet> {
        tokio::time::timeout(SYNC_TIMEOUT, self.pipe.receive())
            .await
            .map_err(|_| CairnError::Timeout("sync"))?
            .ok_or(CairnError::PipeClosed)
    }
}

/// Apply every logged-but-uncommitted entry up to and including `txnid`,
/// in txnid order. Entries already committed are skipped.
pub(crate) fn commit_through(handler: &Arc<dyn ActionHandler>, txnid: crate::types::Txnid) -> Result<()> {
    let last = handler.last_committed_txid()?;
    if txnid <= last {
        return Ok(());
    }
    for entry in handler.log_entries_after(last)? {
        if entry.txnid > txnid {
            break;
        }
        handler.commit(entry.txnid)?;
    }
    Ok(())
}

fn unexpected(got: &Packet, wanted: &str) -> CairnError {
    CairnError::ProtocolViolation(format!(
        "unexpected {} during synchronization, wanted {}",
        got.name(),
        wanted
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_negotiator_waits_for_quorum() {
        let negotiator = Arc::new(EpochNegotiator::new(2));

        let n = Arc::clone(&negotiator);
        let first = tokio::spawn(async move { n.negotiate(&"a".to_string(), 3, true).await });

        // One report of two; nothing established yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(negotiator.established().is_none());

        let epoch = negotiator.negotiate(&"b".to_string(), 5, true).await.unwrap();
        assert_eq!(epoch, 6);
        assert_eq!(first.await.unwrap().unwrap(), 6);
        assert_eq!(negotiator.established(), Some(6));
    }

    #[tokio::test]
    async fn test_negotiator_late_arrival_gets_established_epoch() {
        let negotiator = EpochNegotiator::new(1);
        assert_eq!(
            negotiator.negotiate(&"a".to_string(), 1, true).await.unwrap(),
            2
        );
        // A later, higher report cannot move the established epoch.
        assert_eq!(
            negotiator.negotiate(&"b".to_string(), 9, true).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_negotiator_nonvoting_never_advances_quorum() {
        let negotiator = Arc::new(EpochNegotiator::new(1));

        let n = Arc::clone(&negotiator);
        let watcher = tokio::spawn(async move { n.negotiate(&"w".to_string(), 7, false).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(negotiator.established().is_none());

        assert_eq!(
            negotiator.negotiate(&"a".to_string(), 2, true).await.unwrap(),
            3
        );
        assert_eq!(watcher.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_negotiator_epoch_overflow_is_fatal() {
        let negotiator = EpochNegotiator::new(1);
        assert!(matches!(
            negotiator.negotiate(&"a".to_string(), Epoch::MAX, true).await,
            Err(CairnError::EpochOverflow(_))
        ));
    }

    #[tokio::test]
    async fn test_quorum_ack_tracking() {
        let negotiator = Arc::new(EpochNegotiator::new(2));

        let n = Arc::clone(&negotiator);
        let waiter = tokio::spawn(async move { n.quorum_acked().await });

        negotiator.record_ack(&"a".to_string(), true);
        negotiator.record_ack(&"w".to_string(), false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        negotiator.record_ack(&"b".to_string(), true);
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("quorum acked")
            .unwrap();
    }
}
