//! Voting peer server: election, then leadership or followership.
//!
//! A voting peer loops through election cycles. If it wins, it runs the
//! leader server until killed or until the leader resigns; otherwise it
//! connects to the winner and runs a voting follower cycle. The election
//! site stays open for the duration of the reign so late joiners and
//! watchers probing with solicit votes still learn who leads.

use super::watcher::{run_cycle, CycleOutcome};
use super::{run_leader_server, ActionHandler, Backoff, ElectionSite, PeerRole, RequestMgr};
use crate::config::PeerEndpoint;
use crate::shutdown::Kill;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Run a voting peer. Blocks until killed. The ready signal fires once,
/// the first time this peer enters steady state as leader or follower.
pub async fn run_peer_server(
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
        if kill.is_killed() {
            return;
        }

        match run_term(&host, &peers, &request_mgr, &handler, &kill, &mut ready).await {
            CycleOutcome::Killed => return,
            CycleOutcome::Failed => {
                if let Some(mgr) = &request_mgr {
                    mgr.cleanup_on_error();
                }
                let delay = backoff.next();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = kill.killed() => return,
                }
            }
        }
    }
}

/// One term: elect a leader, then serve in the elected role until the
/// term ends.
async fn run_term(
    host: &PeerEndpoint,
    peers: &[PeerEndpoint],
    request_mgr: &Option<Arc<dyn RequestMgr>>,
    handler: &Arc<dyn ActionHandler>,
    kill: &Kill,
    ready: &mut Option<oneshot::Sender<()>>,
) -> CycleOutcome {
    let site = match ElectionSite::new(host, peers.to_vec(), Arc::clone(handler), false).await {
        Ok(site) => site,
        Err(e) => {
            warn!(fid = %host.fid, error = %e, "failed to open election site");
            return CycleOutcome::Failed;
        }
    };

    let Some(result) = site.start_election() else {
        site.close();
        return CycleOutcome::Failed;
    };

    let winner = tokio::select! {
        winner = result => match winner {
            Ok(endpoint) => endpoint,
            Err(_) => {
                warn!(fid = %host.fid, "election inconclusive");
                site.close();
                return CycleOutcome::Failed;
            }
        },
        _ = kill.killed() => {
            site.close();
            return CycleOutcome::Killed;
        }
    };

    let outcome = if winner.fid == host.fid {
        info!(fid = %host.fid, "elected leader");
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }
        let result = run_leader_server(
            host,
            Arc::clone(handler),
            request_mgr.clone(),
            kill.clone(),
        )
        .await;
        match result {
            Ok(()) => CycleOutcome::Killed,
            Err(e) => {
                warn!(fid = %host.fid, error = %e, "leadership ended");
                CycleOutcome::Failed
            }
        }
    } else {
        info!(fid = %host.fid, leader = %winner.fid, "following elected leader");
        run_cycle(
            winner.message_addr,
            PeerRole::Follower,
            request_mgr.clone(),
            Arc::clone(handler),
            kill.clone(),
            ready,
        )
        .await
    };

    site.close();
    outcome
}
