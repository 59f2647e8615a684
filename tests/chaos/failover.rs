//! Chaos test: replica failover.
//!
//! Replica holders are cut off the network one after another. The remaining
//! nodes notice through failed probes and restore the configured number of
//! replicas among themselves, without ever changing the payload.

use std::collections::BTreeMap;

use reef_integration_tests::{IntegrationCluster, SETTLE, alice, test_data_seeded};
use reef_types::{BasicAcl, ObjectAddress};

const POLICY: &str = "REP 2 IN X CBF 2 SELECT 2 FROM * AS X";

/// 5 nodes, 2 replicas with backups. Block the holders one at a time: two
/// replicas are restored on the remaining nodes each time, and survive the
/// blocked nodes coming back.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(60000)]
async fn test_holders_blocked_one_at_a_time() {
    let c = IntegrationCluster::new(5).await;
    let cid = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    let data = test_data_seeded(8192, 42);
    let oid = c
        .node(0)
        .put_object(cid, alice(), data.clone(), None, BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(cid, oid);
    let (original, _) = c.node(0).get_object(addr, alice()).await.unwrap();

    let initial = c.holders(0, addr).await;
    assert_eq!(initial.len(), 2, "put places exactly two replicas");

    // Watch from a node that did not take part in the write.
    let observer = (0..c.len())
        .find(|&i| !initial.contains(&c.node_id(i)))
        .unwrap();

    let mut blocked = Vec::new();
    for holder in &initial {
        let i = c.index_of(*holder).unwrap();
        c.block(i);
        c.wait_for_reachability(i, false, SETTLE).await.unwrap();
        blocked.push(*holder);

        let holders = c
            .wait_for_holders(observer, addr, 2, &blocked, SETTLE)
            .await
            .unwrap();
        assert!(holders.iter().all(|h| !blocked.contains(h)));

        let (header, payload) = c.node(observer).get_object(addr, alice()).await.unwrap();
        assert_eq!(payload, data);
        assert_eq!(header.payload_hash, original.payload_hash);
    }

    for holder in &blocked {
        let i = c.index_of(*holder).unwrap();
        c.unblock(i);
        c.wait_for_reachability(i, true, SETTLE).await.unwrap();
    }

    let holders = c
        .wait_for_holders(observer, addr, 2, &[], SETTLE)
        .await
        .unwrap();
    assert!(holders.len() >= 2, "recovery must not drop replicas: {holders:?}");
    for i in c.live() {
        let (header, payload) = c.node(i).get_object(addr, alice()).await.unwrap();
        assert_eq!(payload, data);
        assert_eq!(header.payload_hash, original.payload_hash);
    }
}

/// A primary blocked before anyone notices: the write falls through to the
/// backup nodes and still lands two replicas.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_write_falls_back_to_backups() {
    let c = IntegrationCluster::new(5).await;
    let cid = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    c.block(3);
    for i in 0..8u32 {
        let oid = c
            .node(0)
            .put_object(cid, alice(), test_data_seeded(512, i + 1), None, BTreeMap::new())
            .await
            .unwrap();
        let holders = c.holders(0, ObjectAddress::new(cid, oid)).await;
        assert_eq!(holders.len(), 2);
        assert!(!holders.contains(&c.node_id(3)));
    }
}
