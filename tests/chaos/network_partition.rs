//! Chaos test: network partition.
//!
//! A node cut off from the cluster cannot serve what it does not hold and
//! cannot help a write reach its quorum. Once healed it catches up on
//! everything it missed.

use std::collections::BTreeMap;

use reef_engine::wait::{POLL_INTERVAL, wait_until};
use reef_integration_tests::{IntegrationCluster, SETTLE, alice, test_data_seeded};
use reef_types::{BasicAcl, ErrorKind, ObjectAddress};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_isolated_node_reads_after_heal() {
    let c = IntegrationCluster::new(4).await;
    let cid = c
        .create_container(alice(), "REP 2 IN X CBF 2 SELECT 2 FROM * AS X", BasicAcl::Private)
        .await;

    c.block(3);
    let data = test_data_seeded(4096, 9);
    let oid = c
        .node(0)
        .put_object(cid, alice(), data.clone(), None, BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(cid, oid);

    assert!(c.node(3).get_object(addr, alice()).await.is_err());

    c.unblock(3);
    let node = c.node(3);
    let expected = data.clone();
    wait_until("isolated node reads", SETTLE, POLL_INTERVAL, move || {
        let expected = expected.clone();
        async move {
            matches!(node.get_object(addr, alice()).await, Ok((_, payload)) if payload == expected)
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_minority_cannot_reach_quorum() {
    let c = IntegrationCluster::new(3).await;
    let cid = c.create_container(alice(), "REP 3", BasicAcl::Private).await;

    c.block(2);
    let err = c
        .node(0)
        .put_object(cid, alice(), test_data_seeded(64, 1), None, BTreeMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientNodes);

    c.unblock(2);
    c.wait_for_reachability(2, true, SETTLE).await.unwrap();

    let oid = c
        .node(0)
        .put_object(cid, alice(), test_data_seeded(64, 1), None, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(c.holders(0, ObjectAddress::new(cid, oid)).await.len(), 3);
}
