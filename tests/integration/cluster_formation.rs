//! Integration test: cluster formation.
//!
//! Nodes join through a single seed, learn the rest of the membership by
//! gossip, persist it, and agree on the epoch.

use reef_engine::wait::{POLL_INTERVAL, wait_for_epoch, wait_until};
use reef_integration_tests::{IntegrationCluster, SETTLE};

/// 5 nodes joined through node 0: everyone knows everyone.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_join_through_seed_spreads_membership() {
    let c = IntegrationCluster::new(5).await;

    for i in 0..c.len() {
        let peers = c.node(i).cluster().peers().await;
        assert_eq!(peers.len(), 4, "node {i} should know 4 peers");
        assert!(peers.iter().all(|p| p.node_id != c.node_id(i)));
    }

    // Every node persists the members it learned, so a restart can restore them.
    let nodes = c.nodes();
    wait_until("members persisted", SETTLE, POLL_INTERVAL, move || async move {
        nodes
            .iter()
            .all(|n| n.meta().list_members().map(|m| m.len() == 4).unwrap_or(false))
    })
    .await
    .unwrap();
}

/// A tick on any node reaches every node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_epoch_tick_reaches_every_node() {
    let c = IntegrationCluster::new(4).await;
    assert!(c.nodes().iter().all(|n| n.current_epoch() == 0));

    let epoch = c.node(3).tick_epoch().await.unwrap();
    assert_eq!(epoch, 1);
    wait_for_epoch(c.nodes(), 1, SETTLE).await.unwrap();

    c.node(1).tick_epoch().await.unwrap();
    let epoch = c.node(2).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
    assert!(c.nodes().iter().all(|n| n.current_epoch() == 3));
}

/// A node that missed epoch announcements catches up through gossip.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_isolated_node_catches_up_on_epoch() {
    let c = IntegrationCluster::new(4).await;

    c.block(3);
    c.node(0).tick_epoch().await.unwrap();
    let epoch = c.node(0).tick_epoch().await.unwrap();
    assert_eq!(c.node(3).current_epoch(), 0, "blocked node must miss the ticks");

    c.unblock(3);
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
}

/// A node restarted from its metadata restores its members and its epoch.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_restart_restores_members_and_epoch() {
    use std::sync::Arc;

    use reef_engine::{ReefNode, ReefNodeConfig};
    use reef_store::MemoryStore;

    let c = IntegrationCluster::new(3).await;
    c.node(0).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), 1, SETTLE).await.unwrap();

    let original = c.node(2);
    let restarted = ReefNode::new(
        ReefNodeConfig::test_config(),
        original.cluster().local_record().clone(),
        original.meta().clone(),
        Arc::new(MemoryStore::new(u64::MAX)),
        reef_net::SimNetwork::new().transport(original.node_id()),
    )
    .unwrap();

    assert_eq!(restarted.current_epoch(), 1);
    assert_eq!(restarted.restore_members().await.unwrap(), 2);
    assert_eq!(restarted.cluster().node_count().await, 3);
}
