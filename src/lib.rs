//! Cairn - a replicated metadata store with leader-based consensus.
//!
//! A cluster of voting peers elects a leader and linearizably replicates a
//! log of key/value mutations to every follower. Non-voting watchers
//! consume committed state and forward client requests into the cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Cairn                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Supervisors: Peer Server | Watcher Server                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Consensus: Election Site | Sync Proxy | Leader / Follower  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: Peer Pipe (TCP) | Election Votes (UDP)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Persistence: Commit Log | Applied State | Config Scalars   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use cairn::config::CairnConfig;
//!
//! #[tokio::main]
//! async fn main() -> cairn::Result<()> {
//!     let config = CairnConfig::development();
//!     cairn::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod shutdown;
pub mod store;
pub mod types;

// Re-exports
pub use error::{CairnError, Result};
pub use types::*;

use config::CairnConfig;
use protocol::{ClientRequestMgr, RequestMgr};
use shutdown::{Kill, SignalHandler};
use std::sync::Arc;
use store::{MetaStore, StoreHandler};
use tracing::info;

/// Run a Cairn node with the given configuration. Voting members join the
/// consensus ensemble; non-voting members run as watchers. Blocks until a
/// termination signal arrives.
pub async fn run(config: CairnConfig) -> Result<()> {
    observability::init(&config.observability)?;
    config.validate()?;

    let host = config
        .self_endpoint()
        .cloned()
        .ok_or_else(|| CairnError::InvalidConfig {
            field: "cluster.peers".to_string(),
            reason: format!("this node ({:?}) is not a cluster member", config.node.fid),
        })?;

    info!(fid = %config.node.fid, voting = config.node.voting, "starting cairn node");

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store = Arc::new(MetaStore::open(&config.storage.data_dir)?);
    let request_mgr = Arc::new(ClientRequestMgr::new(config.node.fid.clone()));
    let ensemble_size = config.cluster.voters().count() as u64;
    let handler = Arc::new(StoreHandler::new(
        store,
        config.node.fid.clone(),
        ensemble_size,
        Some(Arc::clone(&request_mgr)),
    ));

    let kill = Kill::new();
    tokio::spawn(SignalHandler::new(kill.clone()).run());

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    {
        let fid = config.node.fid.clone();
        tokio::spawn(async move {
            if ready_rx.await.is_ok() {
                info!(fid = %fid, "node entered steady state");
            }
        });
    }

    let mgr: Arc<dyn RequestMgr> = request_mgr;
    if config.node.voting {
        protocol::run_peer_server(
            host,
            config.cluster.peers.clone(),
            Some(mgr),
            handler,
            kill,
            ready_tx,
        )
        .await;
    } else {
        protocol::run_watcher_server_with_election(
            host,
            config.cluster.peers.clone(),
            Some(mgr),
            handler,
            kill,
            ready_tx,
        )
        .await;
    }

    info!("cairn node stopped");
    Ok(())
}
