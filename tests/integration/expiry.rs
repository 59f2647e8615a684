//! Integration test: object expiration.
//!
//! An object with `expire_at = e` is readable while the epoch is at most `e`
//! and gone from every node once the epoch passes `e` and garbage collection
//! runs.

use std::collections::BTreeMap;

use reef_engine::EngineError;
use reef_engine::wait::{POLL_INTERVAL, wait_for_epoch, wait_until};
use reef_integration_tests::{IntegrationCluster, SETTLE, alice, test_data, test_data_seeded};
use reef_store::PayloadStore;
use reef_types::{BasicAcl, ObjectAddress};

const POLICY: &str = "REP 2 IN X CBF 1 SELECT 2 FROM * AS X";

/// Two ticks past creation, one collection pass: the object is not found.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_expired_object_not_found_after_two_ticks() {
    let c = IntegrationCluster::new(3).await;
    let cid = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    let expire_at = c.node(0).current_epoch() + 1;
    let oid = c
        .node(0)
        .put_object(cid, alice(), test_data(1024), Some(expire_at), BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(cid, oid);

    c.node(0).tick_epoch().await.unwrap();
    let epoch = c.node(0).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();

    for node in c.nodes() {
        node.collect_garbage().await.unwrap();
    }
    for node in c.nodes() {
        let err = node.get_object(addr, alice()).await.unwrap_err();
        assert!(
            matches!(err, EngineError::ObjectNotFound(_)),
            "expected ObjectNotFound, got {err}"
        );
        assert!(node.meta().get_object(&addr).unwrap().is_none());
    }
}

/// Readable through the expiration epoch itself, gone right after.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_expiry_boundary_is_inclusive() {
    let c = IntegrationCluster::new(3).await;
    let cid = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    let expire_at = c.node(1).current_epoch() + 1;
    let data = test_data(512);
    let oid = c
        .node(1)
        .put_object(cid, alice(), data.clone(), Some(expire_at), BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(cid, oid);

    // current == expire_at: still live everywhere.
    let epoch = c.node(0).tick_epoch().await.unwrap();
    assert_eq!(epoch, expire_at);
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
    for node in c.nodes() {
        let (_, payload) = node.get_object(addr, alice()).await.unwrap();
        assert_eq!(payload, data);
    }

    // current > expire_at: hidden immediately, collected in the background.
    let epoch = c.node(0).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
    for node in c.nodes() {
        assert!(node.get_object(addr, alice()).await.unwrap_err().is_not_found());
    }

    let nodes = c.nodes();
    wait_until("expired replicas collected", SETTLE, POLL_INTERVAL, move || async move {
        for node in nodes {
            if node.store().get(addr).await.ok().flatten().is_some() {
                return false;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(c.nodes().iter().any(|n| n.gc_passes() > 0));
}

/// Objects without an expiration survive any number of ticks and passes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_objects_without_expiry_survive() {
    let c = IntegrationCluster::new(3).await;
    let cid = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    let mut objects = Vec::new();
    for i in 0..10u32 {
        let data = test_data_seeded(256 + i as usize, i + 1);
        let expire_at = (i % 2 == 0).then_some(1);
        let oid = c
            .node(i as usize % 3)
            .put_object(cid, alice(), data.clone(), expire_at, BTreeMap::new())
            .await
            .unwrap();
        objects.push((ObjectAddress::new(cid, oid), data, expire_at));
    }

    for _ in 0..3 {
        c.node(2).tick_epoch().await.unwrap();
    }
    wait_for_epoch(c.nodes(), 3, SETTLE).await.unwrap();
    for node in c.nodes() {
        node.collect_garbage().await.unwrap();
    }

    for (addr, data, expire_at) in &objects {
        let result = c.node(0).get_object(*addr, alice()).await;
        match expire_at {
            Some(_) => assert!(result.unwrap_err().is_not_found(), "{addr} should be gone"),
            None => assert_eq!(&result.unwrap().1, data, "{addr} should survive"),
        }
    }
}
