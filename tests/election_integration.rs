//! Leader election integration tests over real UDP sockets.

#[allow(dead_code)]
mod common;

use cairn::protocol::ElectionSite;
use common::MemHandler;
use std::sync::Arc;
use std::time::Duration;
use cairn::types::Txnid;

const ELECTION_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_three_empty_voters_converge_on_highest_fid() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    let mut sites = Vec::new();
    let mut results = Vec::new();
    for endpoint in &endpoints {
        let handler = Arc::new(MemHandler::new(&endpoint.fid, 3));
        let site = ElectionSite::new(endpoint, endpoints.clone(), handler, false)
            .await
            .unwrap();
        sites.push(site);
    }
    for site in &sites {
        results.push(site.start_election().expect("election startable"));
    }

    for result in results {
        let winner = tokio::time::timeout(ELECTION_DEADLINE, result)
            .await
            .expect("election concluded")
            .expect("winner emitted");
        assert_eq!(winner.fid, "c");
    }

    for site in &sites {
        site.close();
    }
}

#[tokio::test]
async fn test_more_durable_log_beats_higher_fid() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    let mut sites = Vec::new();
    let mut results = Vec::new();
    for endpoint in &endpoints {
        let handler = Arc::new(MemHandler::new(&endpoint.fid, 3));
        if endpoint.fid == "a" {
            // "a" has durable history the others lack.
            handler.seed_log(&[(Txnid::new(1, 1), "k", b"v")], Txnid::new(1, 1));
            handler.set_epochs(1, 1);
        }
        let site = ElectionSite::new(endpoint, endpoints.clone(), handler, false)
            .await
            .unwrap();
        sites.push(site);
    }
    for site in &sites {
        results.push(site.start_election().expect("election startable"));
    }

    for result in results {
        let winner = tokio::time::timeout(ELECTION_DEADLINE, result)
            .await
            .expect("election concluded")
            .expect("winner emitted");
        assert_eq!(winner.fid, "a");
    }

    for site in &sites {
        site.close();
    }
}

#[tokio::test]
async fn test_solicit_probe_discovers_established_leader() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    // Run the voter election to completion; the sites stay open answering
    // probes afterwards.
    let mut sites = Vec::new();
    let mut results = Vec::new();
    for endpoint in &endpoints {
        let handler = Arc::new(MemHandler::new(&endpoint.fid, 3));
        let site = ElectionSite::new(endpoint, endpoints.clone(), handler, false)
            .await
            .unwrap();
        sites.push(site);
    }
    for site in &sites {
        results.push(site.start_election().expect("election startable"));
    }
    for result in results {
        tokio::time::timeout(ELECTION_DEADLINE, result)
            .await
            .expect("election concluded")
            .expect("winner emitted");
    }

    // A late joiner probes with solicit votes; voter tallies stay
    // untouched and the probe converges on the same leader.
    let watcher_endpoints = common::make_endpoints(&[("w", false)]);
    let watcher_handler = Arc::new(MemHandler::new("w", 3));
    let probe_site = ElectionSite::new(
        &watcher_endpoints[0],
        endpoints.clone(),
        watcher_handler,
        true,
    )
    .await
    .unwrap();

    let winner = tokio::time::timeout(
        ELECTION_DEADLINE,
        probe_site.start_election().expect("probe startable"),
    )
    .await
    .expect("probe concluded")
    .expect("winner emitted");
    assert_eq!(winner.fid, "c");

    probe_site.close();
    for site in &sites {
        site.close();
    }
}

#[tokio::test]
async fn test_election_without_quorum_stays_open() {
    let endpoints = common::make_endpoints(&[("a", true), ("b", true), ("c", true)]);

    // Only one of three voters is up; no quorum can form.
    let handler = Arc::new(MemHandler::new("a", 3));
    let site = ElectionSite::new(&endpoints[0], endpoints.clone(), handler, false)
        .await
        .unwrap();
    let mut result = site.start_election().expect("election startable");

    let premature = tokio::time::timeout(Duration::from_millis(1500), &mut result).await;
    assert!(premature.is_err(), "no winner without a quorum");

    // Closing the site closes the channel; the caller reads that as an
    // inconclusive election.
    site.close();
    let outcome = tokio::time::timeout(Duration::from_secs(2), result).await;
    match outcome {
        Ok(Err(_)) => {}
        Ok(Ok(winner)) => panic!("unexpected winner {:?}", winner.fid),
        Err(_) => panic!("channel must close after site close"),
    }
}

#[tokio::test]
async fn test_start_election_is_single_shot() {
    let endpoints = common::make_endpoints(&[("a", true)]);
    let handler = Arc::new(MemHandler::new("a", 1));
    let site = ElectionSite::new(&endpoints[0], endpoints.clone(), handler, false)
        .await
        .unwrap();

    assert!(site.start_election().is_some());
    assert!(site.start_election().is_none());
    site.close();
}
