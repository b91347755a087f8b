//! Watcher server: supervised connect / synchronize / follow cycles.
//!
//! A watcher finds the leader (given directly or through an election),
//! connects, synchronizes, and runs a non-voting follower actor that
//! forwards client requests. Any failure tears the cycle down and the
//! supervisor retries with exponential backoff, from
//! [`RETRY_BACKOFF`](super::RETRY_BACKOFF) up to
//! [`MAX_RETRY_BACKOFF`](super::MAX_RETRY_BACKOFF).
//!
//! The ready signal fires exactly once, the first time any cycle reaches
//! steady state; the supervisor owns the guard so it survives failed and
//! panicking cycles alike. A panic inside a cycle is caught at the task
//! boundary, logged, and treated as a failed cycle; this is the only
//! place panics are swallowed.

use super::{
    ActionHandler, Backoff, ElectionSite, Follower, FollowerSyncProxy, PeerRole, RequestHandle,
    RequestMgr,
};
use crate::config::PeerEndpoint;
use crate::net::PeerPipe;
use crate::shutdown::Kill;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One supervised cycle's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleOutcome {
    /// The supervisor was killed; stop retrying.
    Killed,
    /// The cycle failed or terminated; retry after backoff.
    Failed,
}

/// Run a watcher against a fixed leader address. Blocks until killed.
pub async fn run_watcher_server(
    leader_addr: String,
    handler: Arc<dyn ActionHandler>,
    kill: Kill,
    ready: oneshot::Sender<()>,
) {
    run_watcher_server_with_request(leader_addr, None, handler, kill, ready).await
}

/// Run a watcher against a fixed leader address, forwarding client
/// requests from `request_mgr`. Blocks until killed.
pub async fn run_watcher_server_with_request(
    leader_addr: String,
    request_mgr: Option<Arc<dyn RequestMgr>>,
    handler: Arc<dyn ActionHandler>,
    kill: Kill,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new();

    loop {
        let outcome = run_cycle(
            leader_addr.clone(),
            PeerRole::Watcher,
            request_mgr.clone(),
            Arc::clone(&handler),
            kill.clone(),
            &mut ready,
        )
        .await;

        if outcome == CycleOutcome::Killed {
            return;
        }
        if let Some(mgr) = &request_mgr {
            mgr.cleanup_on_error();
        }

        let delay = backoff.next();
        debug!(delay_ms = delay.as_millis() as u64, "watcher retrying after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = kill.killed() => return,
        }
    }
}

/// Run a watcher that first elects, then connects to the winner's message
/// endpoint. Blocks until killed.
pub async fn run_watcher_server_with_election(
    host: PeerEndpoint,
    peers: Vec<PeerEndpoint>,
    request_mgr: Option<Arc<dyn RequestMgr>>,
    handler: Arc<dyn ActionHandler>,
    kill: Kill,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut backoff = Backoff::new();

    loop {
        let leader = match find_peer_to_connect(&host, &peers, &handler, &kill).await {
            FindOutcome::Killed => return,
            FindOutcome::NotFound => None,
            FindOutcome::Found(endpoint) => Some(endpoint),
        };

        if let Some(leader) = leader {
            let outcome = run_cycle(
                leader.message_addr,
                PeerRole::Watcher,
                request_mgr.clone(),
                Arc::clone(&handler),
                kill.clone(),
                &mut ready,
            )
            .await;

            if outcome == CycleOutcome::Killed {
                return;
            }
            if let Some(mgr) = &request_mgr {
                mgr.cleanup_on_error();
            }
        }

        let delay = backoff.next();
        debug!(delay_ms = delay.as_millis() as u64, "watcher retrying after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = kill.killed() => return,
        }
    }
}

enum FindOutcome {
    Found(PeerEndpoint),
    NotFound,
    Killed,
}

/// Run a solicit-only election to learn who the leader is.
async fn find_peer_to_connect(
    host: &PeerEndpoint,
    peers: &[PeerEndpoint],
    handler: &Arc<dyn ActionHandler>,
    kill: &Kill,
) -> FindOutcome {
    let site = match ElectionSite::new(host, peers.to_vec(), Arc::clone(handler), true).await {
        Ok(site) => site,
        Err(e) => {
            warn!(error = %e, "failed to open election site");
            return FindOutcome::NotFound;
        }
    };

    let Some(result) = site.start_election() else {
        warn!("election site already in progress or closed");
        site.close();
        return FindOutcome::NotFound;
    };

    let outcome = tokio::select! {
        winner = result => match winner {
            Ok(endpoint) => {
                info!(leader = %endpoint.fid, "election identified leader");
                FindOutcome::Found(endpoint)
            }
            Err(_) => {
                warn!("election inconclusive");
                FindOutcome::NotFound
            }
        },
        _ = kill.killed() => FindOutcome::Killed,
    };
    site.close();
    outcome
}

/// Run one connection-and-follow cycle in its own task so a panic is
/// contained, logged, and converted into a failed cycle. The ready guard
/// stays with the caller and fires the first time any cycle signals
/// steady state.
pub(crate) async fn run_cycle(
    peer_addr: String,
    role: PeerRole,
    request_mgr: Option<Arc<dyn RequestMgr>>,
    handler: Arc<dyn ActionHandler>,
    kill: Kill,
    ready: &mut Option<oneshot::Sender<()>>,
) -> CycleOutcome {
    let (steady_tx, steady_rx) = oneshot::channel::<()>();
    let mut steady_rx = steady_rx;
    let mut steady_seen = false;

    let mut task = tokio::spawn(run_once(
        peer_addr, role, request_mgr, handler, kill, steady_tx,
    ));

    loop {
        tokio::select! {
            entered = &mut steady_rx, if !steady_seen => {
                steady_seen = true;
                if entered.is_ok() {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
            }
            result = &mut task => {
                return match result {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        error!(panic = ?e, "panic in watcher cycle");
                        CycleOutcome::Failed
                    }
                    Err(_) => CycleOutcome::Failed,
                };
            }
        }
    }
}

async fn run_once(
    peer_addr: String,
    role: PeerRole,
    request_mgr: Option<Arc<dyn RequestMgr>>,
    handler: Arc<dyn ActionHandler>,
    kill: Kill,
    steady: oneshot::Sender<()>,
) -> CycleOutcome {
    let pipe = match PeerPipe::connect(&peer_addr, CONNECT_TIMEOUT).await {
        Ok(pipe) => Arc::new(pipe),
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "connection failed");
            return CycleOutcome::Failed;
        }
    };
    info!(peer = %peer_addr, role = %role, "connected to peer");

    // Synchronize. A kill closes the pipe, which errs the proxy out.
    let voting = role == PeerRole::Follower;
    let proxy = FollowerSyncProxy::new(Arc::clone(&pipe), Arc::clone(&handler), voting);
    let mut done = proxy.start(kill.clone());

    let synced = tokio::select! {
        result = &mut done => result.unwrap_or(false),
        _ = kill.killed() => {
            debug!(peer = %peer_addr, "kill during synchronization");
            pipe.close();
            return CycleOutcome::Killed;
        }
    };
    if !synced {
        warn!(peer = %peer_addr, "failed to synchronize with peer");
        pipe.close();
        return CycleOutcome::Failed;
    }

    // Steady state: run the follower actor and pump client requests.
    let follower = Follower::new(role, Arc::clone(&pipe), handler);
    let mut actor = follower.start(kill.clone());
    let _ = steady.send(());

    loop {
        tokio::select! {
            _ = kill.killed() => {
                info!(peer = %peer_addr, "kill received, terminating");
                actor.terminate();
                return CycleOutcome::Killed;
            }
            _ = actor.done() => {
                warn!(peer = %peer_addr, "protocol actor terminated");
                return CycleOutcome::Failed;
            }
            incoming = next_request(&request_mgr) => {
                match incoming {
                    Some(handle) => {
                        let request = handle.request.clone();
                        if let Some(mgr) = &request_mgr {
                            mgr.add_pending_request(handle);
                        }
                        if !actor.forward_request(request).await {
                            warn!(peer = %peer_addr, "failed to forward request, terminating");
                            actor.terminate();
                            return CycleOutcome::Failed;
                        }
                    }
                    None => {
                        warn!("request channel closed, terminating");
                        actor.terminate();
                        return CycleOutcome::Failed;
                    }
                }
            }
        }
    }
}

/// Await the next client request, or park forever when no manager is
/// wired in.
async fn next_request(mgr: &Option<Arc<dyn RequestMgr>>) -> Option<RequestHandle> {
    match mgr {
        Some(mgr) => mgr.next_request().await,
        None => futures::future::pending().await,
    }
}
