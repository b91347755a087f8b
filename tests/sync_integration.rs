//! Synchronization handshake tests over real socket pairs.

#[allow(dead_code)]
mod common;

use cairn::net::PeerPipe;
use cairn::protocol::{EpochNegotiator, FollowerSyncProxy, LeaderSyncProxy};
use cairn::shutdown::Kill;
use cairn::types::Txnid;
use common::MemHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

async fn pipe_pair() -> (Arc<PeerPipe>, Arc<PeerPipe>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let client = TcpStream::connect(addr).await.unwrap();
    let server = accept.await.unwrap();
    (
        Arc::new(PeerPipe::new(client).unwrap()),
        Arc::new(PeerPipe::new(server).unwrap()),
    )
}

#[tokio::test]
async fn test_stale_follower_catches_up() {
    let (leader_pipe, follower_pipe) = pipe_pair().await;

    // Leader holds epoch-2 history; the follower stopped at (1,5).
    let leader_handler = Arc::new(MemHandler::new("L", 1));
    leader_handler.seed_log(
        &[
            (Txnid::new(1, 4), "k4", b"v4"),
            (Txnid::new(1, 5), "k5", b"v5"),
            (Txnid::new(1, 6), "k6", b"v6"),
            (Txnid::new(2, 1), "k7", b"v7"),
            (Txnid::new(2, 2), "k8", b"v8"),
        ],
        Txnid::new(2, 1),
    );
    leader_handler.set_epochs(2, 2);

    let follower_handler = Arc::new(MemHandler::new("F", 1));
    follower_handler.seed_log(
        &[(Txnid::new(1, 4), "k4", b"v4"), (Txnid::new(1, 5), "k5", b"v5")],
        Txnid::new(1, 4),
    );
    follower_handler.set_epochs(2, 2);

    let negotiator = Arc::new(EpochNegotiator::new(1));
    let leader_proxy = LeaderSyncProxy::new(
        leader_pipe,
        Arc::clone(&leader_handler) as _,
        negotiator,
    );
    let leader_side = tokio::spawn(async move { leader_proxy.run().await });

    let follower_proxy = FollowerSyncProxy::new(
        follower_pipe,
        Arc::clone(&follower_handler) as _,
        true,
    );
    let done = follower_proxy.start(Kill::new());

    let synced = tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("sync concluded")
        .expect("done signal");
    assert!(synced, "follower synchronized");

    let synced_peer = leader_side.await.unwrap().unwrap();
    assert_eq!(synced_peer.fid, "F");
    assert!(synced_peer.voting);

    // The follower holds the full log and the leader's durable prefix.
    assert_eq!(
        follower_handler.log_txnids(),
        vec![
            Txnid::new(1, 4),
            Txnid::new(1, 5),
            Txnid::new(1, 6),
            Txnid::new(2, 1),
            Txnid::new(2, 2),
        ]
    );
    assert_eq!(follower_handler.committed(), Txnid::new(2, 1));
    assert_eq!(follower_handler.applied("k7"), Some(b"v7".to_vec()));
    // The follower's own logged-but-uncommitted (1,5) was caught up too.
    assert_eq!(follower_handler.applied("k5"), Some(b"v5".to_vec()));

    // NEW-LEADER fixed the follower's epochs to the negotiated value
    // (max accepted of the quorum + 1 = 3).
    assert_eq!(follower_handler.epochs(), (3, 3));
}

#[tokio::test]
async fn test_stale_leader_rejected() {
    let (leader_pipe, follower_pipe) = pipe_pair().await;

    // Establish epoch 3 on the leader side before the follower connects.
    let negotiator = Arc::new(EpochNegotiator::new(1));
    negotiator
        .negotiate(&"L".to_string(), 2, true)
        .await
        .unwrap();
    assert_eq!(negotiator.established(), Some(3));

    let leader_handler = Arc::new(MemHandler::new("L", 1));
    let leader_proxy = LeaderSyncProxy::new(leader_pipe, leader_handler as _, negotiator);
    let leader_side = tokio::spawn(async move { leader_proxy.run().await });

    // The follower already acknowledged epoch 5; the offer of 3 is stale.
    let follower_handler = Arc::new(MemHandler::new("F", 1));
    follower_handler.set_epochs(5, 5);

    let follower_proxy =
        FollowerSyncProxy::new(Arc::clone(&follower_pipe), follower_handler.clone() as _, true);
    let done = follower_proxy.start(Kill::new());

    let synced = tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("sync concluded")
        .expect("done signal");
    assert!(!synced, "stale leader must be rejected");

    // The follower's epochs are untouched.
    assert_eq!(follower_handler.epochs(), (5, 5));

    // The leader side fails once the follower walks away.
    follower_pipe.close();
    let leader_result = tokio::time::timeout(Duration::from_secs(5), leader_side)
        .await
        .expect("leader proxy concluded")
        .unwrap();
    assert!(leader_result.is_err());
}

#[tokio::test]
async fn test_kill_aborts_synchronization() {
    let (_leader_pipe, follower_pipe) = pipe_pair().await;

    // Nobody answers on the leader side; the kill must end the handshake
    // promptly.
    let follower_handler = Arc::new(MemHandler::new("F", 1));
    let proxy = FollowerSyncProxy::new(follower_pipe, follower_handler as _, false);

    let kill = Kill::new();
    let done = proxy.start(kill.clone());

    kill.kill();
    let synced = tokio::time::timeout(Duration::from_secs(1), done)
        .await
        .expect("kill unblocked the proxy")
        .expect("done signal");
    assert!(!synced);
}

#[tokio::test]
async fn test_watcher_is_not_counted_toward_epoch_quorum() {
    let (leader_pipe, watcher_pipe) = pipe_pair().await;

    // Quorum of two voters; a watcher alone must not establish an epoch.
    let negotiator = Arc::new(EpochNegotiator::new(2));

    let leader_handler = Arc::new(MemHandler::new("L", 2));
    let leader_proxy = LeaderSyncProxy::new(leader_pipe, leader_handler as _, negotiator.clone());
    let leader_side = tokio::spawn(async move { leader_proxy.run().await });

    let watcher_handler = Arc::new(MemHandler::new("W", 2));
    let watcher_proxy = FollowerSyncProxy::new(watcher_pipe, watcher_handler as _, false);
    let done = watcher_proxy.start(Kill::new());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(negotiator.established(), None);

    // A voter report completes the quorum and unblocks the watcher.
    negotiator
        .negotiate(&"L".to_string(), 0, true)
        .await
        .unwrap();
    negotiator.negotiate(&"F".to_string(), 0, true).await.unwrap();

    let synced = tokio::time::timeout(Duration::from_secs(5), done)
        .await
        .expect("sync concluded")
        .expect("done signal");
    assert!(synced);
    let _ = leader_side.await;
}
