//! Full-cluster integration: election, synchronization, and replication
//! across three voting peers on real sockets.

#[allow(dead_code)]
mod common;

use cairn::protocol::{run_peer_server, ClientRequestMgr, RequestMgr};
use cairn::shutdown::Kill;
use cairn::types::{OpCode, Txnid};
use common::MemHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Three empty voters elect the lexicographically highest fid, then a
/// client mutation submitted through the first peer replicates and
/// commits everywhere with txnid (1,1).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_peer_happy_path() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    let mut handlers = Vec::new();
    let mut mgrs = Vec::new();
    let mut readies = Vec::new();
    let kill = Kill::new();

    for endpoint in &endpoints {
        let mgr = Arc::new(ClientRequestMgr::new(endpoint.fid.clone()));
        let handler = Arc::new(
            MemHandler::new(&endpoint.fid, 3).with_request_mgr(Arc::clone(&mgr)),
        );
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let host = endpoint.clone();
            let peers = endpoints.clone();
            let mgr: Arc<dyn RequestMgr> = Arc::clone(&mgr) as _;
            let handler = Arc::clone(&handler);
            let kill = kill.clone();
            tokio::spawn(async move {
                run_peer_server(host, peers, Some(mgr), handler as _, kill, ready_tx).await;
            });
        }

        handlers.push(handler);
        mgrs.push(mgr);
        readies.push(ready_rx);
    }

    for ready in readies {
        tokio::time::timeout(Duration::from_secs(20), ready)
            .await
            .expect("peer became ready")
            .expect("ready signal");
    }

    // The leader's reign is epoch 1; a mutation submitted through peer
    // "a" must land as txnid (1,1) on every peer.
    let done = mgrs[0]
        .submit(OpCode::Set, "k", b"v".to_vec())
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(20), done)
        .await
        .expect("request concluded")
        .expect("completion delivered");
    assert_eq!(outcome, Ok(()));

    for handler in &handlers {
        let handler = Arc::clone(handler);
        assert!(
            common::wait_until(Duration::from_secs(10), move || {
                handler.committed() == Txnid::new(1, 1)
            })
            .await,
            "every peer commits (1,1)"
        );
    }
    for handler in &handlers {
        assert_eq!(handler.log_txnids(), vec![Txnid::new(1, 1)]);
        assert_eq!(handler.applied("k"), Some(b"v".to_vec()));
        let (accepted, current) = handler.epochs();
        assert_eq!(accepted, 1);
        assert_eq!(current, 1);
    }

    kill.kill();
}

/// Requests submitted through different peers serialize into one strictly
/// increasing commit stream.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutations_from_all_peers_serialize() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    let mut handlers = Vec::new();
    let mut mgrs = Vec::new();
    let mut readies = Vec::new();
    let kill = Kill::new();

    for endpoint in &endpoints {
        let mgr = Arc::new(ClientRequestMgr::new(endpoint.fid.clone()));
        let handler = Arc::new(
            MemHandler::new(&endpoint.fid, 3).with_request_mgr(Arc::clone(&mgr)),
        );
        let (ready_tx, ready_rx) = oneshot::channel();

        {
            let host = endpoint.clone();
            let peers = endpoints.clone();
            let mgr: Arc<dyn RequestMgr> = Arc::clone(&mgr) as _;
            let handler = Arc::clone(&handler);
            let kill = kill.clone();
            tokio::spawn(async move {
                run_peer_server(host, peers, Some(mgr), handler as _, kill, ready_tx).await;
            });
        }

        handlers.push(handler);
        mgrs.push(mgr);
        readies.push(ready_rx);
    }

    for ready in readies {
        tokio::time::timeout(Duration::from_secs(20), ready)
            .await
            .expect("peer became ready")
            .expect("ready signal");
    }

    let mut completions = Vec::new();
    for (i, mgr) in mgrs.iter().enumerate() {
        let key = format!("k{}", i);
        completions.push(
            mgr.submit(OpCode::Set, &key, b"v".to_vec()).await.unwrap(),
        );
    }
    for done in completions {
        let outcome = tokio::time::timeout(Duration::from_secs(20), done)
            .await
            .expect("request concluded")
            .expect("completion delivered");
        assert_eq!(outcome, Ok(()));
    }

    // All three mutations committed under epoch 1 with distinct,
    // gap-free txnids on every peer.
    for handler in &handlers {
        let handler_clone = Arc::clone(handler);
        assert!(
            common::wait_until(Duration::from_secs(10), move || {
                handler_clone.committed() == Txnid::new(1, 3)
            })
            .await,
            "every peer commits through (1,3)"
        );
        assert_eq!(
            handler.log_txnids(),
            vec![Txnid::new(1, 1), Txnid::new(1, 2), Txnid::new(1, 3)]
        );
        for i in 0..3 {
            assert_eq!(handler.applied(&format!("k{}", i)), Some(b"v".to_vec()));
        }
    }

    kill.kill();
}
