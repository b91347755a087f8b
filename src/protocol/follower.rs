//! Steady-state follower actor.
//!
//! After synchronization the pipe is handed to a [`Follower`], which runs
//! two tasks: a reader that drains the pipe into the per-peer observer, and
//! the actor loop that consumes the observer and drives the persistence
//! layer. Watchers run exactly the same actor; the only behavioral
//! difference is that a watcher never emits accepts and is never counted
//! in quorums.

use super::{ActionHandler, Observer, PeerRole, SYNC_TIMEOUT};
use crate::error::{CairnError, Result};
use crate::message::{factory, Packet, Request};
use crate::net::PeerPipe;
use crate::shutdown::Kill;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A follower or watcher protocol actor bound to one pipe.
pub struct Follower {
    role: PeerRole,
    pipe: Arc<PeerPipe>,
    handler: Arc<dyn ActionHandler>,
    observer: Arc<Observer>,
}

/// Handle to a running follower actor.
pub struct FollowerHandle {
    pipe: Arc<PeerPipe>,
    local_kill: Kill,
    done: tokio::sync::oneshot::Receiver<()>,
}

impl Follower {
    pub fn new(role: PeerRole, pipe: Arc<PeerPipe>, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            role,
            pipe,
            handler,
            observer: Arc::new(Observer::new()),
        }
    }

    /// Spawn the reader and actor loops. The returned handle forwards
    /// requests and reports termination; `kill` tears the actor down from
    /// outside.
    pub fn start(self, kill: Kill) -> FollowerHandle {
        let local_kill = Kill::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        // Propagate the supervisor's kill into this actor's scope. The
        // bridge dies with the actor so retried cycles don't leak tasks.
        {
            let parent = kill;
            let local = local_kill.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.killed() => local.kill(),
                    _ = local.killed() => {}
                }
            });
        }

        // Reader: pipe to observer. Connection loss ends the actor.
        {
            let pipe = Arc::clone(&self.pipe);
            let observer = Arc::clone(&self.observer);
            let local = local_kill.clone();
            tokio::spawn(async move {
                while let Some(packet) = pipe.receive().await {
                    observer.send(packet);
                }
                debug!(peer = %pipe.addr(), "follower pipe closed");
                local.kill();
            });
        }

        // Actor loop.
        {
            let role = self.role;
            let pipe = Arc::clone(&self.pipe);
            let handler = Arc::clone(&self.handler);
            let observer = Arc::clone(&self.observer);
            let local = local_kill.clone();
            tokio::spawn(async move {
                info!(role = %role, peer = %pipe.addr(), "follower actor started");
                let result = actor_loop(role, &pipe, &handler, &observer, &local).await;
                match result {
                    Ok(()) => debug!(role = %role, "follower actor terminated"),
                    Err(e) => warn!(role = %role, error = %e, "follower actor failed"),
                }
                local.kill();
                pipe.close();
                let _ = done_tx.send(());
            });
        }

        FollowerHandle {
            pipe: self.pipe,
            local_kill,
            done: done_rx,
        }
    }
}

impl FollowerHandle {
    /// Forward a locally-originated client request to the leader. Returns
    /// `false` if the pipe is gone.
    pub async fn forward_request(&self, request: Request) -> bool {
        self.pipe.send(Packet::Request(request)).await
    }

    /// Wait for the actor to terminate.
    pub async fn done(&mut self) {
        let _ = (&mut self.done).await;
    }

    /// Tear the actor down and close its pipe.
    pub fn terminate(&self) {
        self.local_kill.kill();
        self.pipe.close();
    }
}

async fn actor_loop(
    role: PeerRole,
    pipe: &Arc<PeerPipe>,
    handler: &Arc<dyn ActionHandler>,
    observer: &Arc<Observer>,
    kill: &Kill,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = kill.killed() => return Ok(()),
            packet = observer.next() => {
                handle_packet(role, pipe, handler, packet).await?;
            }
            // Inactivity bounds the actor; a silent leader means the
            // connection is effectively dead.
            _ = tokio::time::sleep(SYNC_TIMEOUT) => {
                return Err(CairnError::Timeout("follower inactivity"));
            }
        }
    }
}

async fn handle_packet(
    role: PeerRole,
    pipe: &Arc<PeerPipe>,
    handler: &Arc<dyn ActionHandler>,
    packet: Packet,
) -> Result<()> {
    match packet {
        Packet::Proposal(proposal) => {
            let txnid = proposal.txnid;
            if let Err(e) = handler.log_proposal(&proposal) {
                // Persistence failure aborts the proposal and the actor.
                let _ = handler.abort(&proposal.fid, proposal.reqid, &e.to_string());
                return Err(e);
            }
            if role == PeerRole::Follower {
                let fid = handler.follower_id();
                if !pipe.send(factory::accept(txnid, &fid)).await {
                    return Err(CairnError::PipeClosed);
                }
            }
        }
        Packet::Commit(commit) => {
            let last = handler.last_committed_txid()?;
            if commit.txnid <= last {
                debug!(txnid = %commit.txnid, last = %last, "stale commit ignored");
                return Ok(());
            }
            // Apply everything logged up to the commit barrier, in order.
            super::sync::commit_through(handler, commit.txnid)?;
        }
        Packet::Abort(abort) => {
            handler.abort(&abort.fid, abort.reqid, &abort.error)?;
        }
        Packet::Response(response) => {
            handler.respond(&response.fid, response.reqid, &response.error)?;
        }
        other => {
            warn!(packet = other.name(), "unexpected packet in follower loop");
        }
    }
    Ok(())
}
