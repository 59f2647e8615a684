//! Integration test: container lifecycle.
//!
//! Containers created on one node become visible everywhere; deleted ones
//! disappear everywhere and take their objects with them once the epoch
//! moves on.

use std::collections::BTreeMap;

use reef_engine::wait::{
    POLL_INTERVAL, wait_for_container_creation, wait_for_container_deletion, wait_for_epoch,
    wait_until,
};
use reef_engine::{EngineError, ReefEngine};
use reef_integration_tests::{IntegrationCluster, SETTLE, alice, bob, test_data};
use reef_store::PayloadStore;
use reef_types::{BasicAcl, ErrorKind, ObjectAddress};

const POLICY: &str = "REP 2 IN X CBF 1 SELECT 2 FROM * AS X";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_create_is_listed_on_every_node() {
    let c = IntegrationCluster::new(4).await;
    let id = c
        .node(1)
        .create_container_with_policy(alice(), POLICY, BasicAcl::PublicRead, Some("photos".into()))
        .await
        .unwrap();
    wait_for_container_creation(c.nodes(), id, SETTLE)
        .await
        .unwrap();

    for node in c.nodes() {
        assert_eq!(node.list_containers(&alice()).unwrap(), vec![id]);
        assert!(node.list_containers(&bob()).unwrap().is_empty());

        let container = node.get_container(&id).unwrap();
        assert_eq!(container.owner, alice());
        assert_eq!(container.basic_acl, BasicAcl::PublicRead);
        assert_eq!(container.name.as_deref(), Some("photos"));
        assert_eq!(container.placement_policy.to_string(), POLICY);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_delete_and_tick_removes_everywhere() {
    let c = IntegrationCluster::new(4).await;
    let id = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    // Only the owner may delete, from any node.
    let err = c.node(2).delete_container(&id, &bob()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    c.node(2).delete_container(&id, &alice()).await.unwrap();
    let epoch = c.node(2).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
    wait_for_container_deletion(c.nodes(), id, SETTLE)
        .await
        .unwrap();

    for node in c.nodes() {
        assert!(matches!(
            node.get_container(&id),
            Err(EngineError::ContainerNotFound(_))
        ));
        assert!(node.list_containers(&alice()).unwrap().is_empty());
        // The tombstone stays behind.
        let record = node.meta().get_container(&id).unwrap().unwrap();
        assert_eq!(record.deleted_at, Some(epoch - 1));
    }

    // Deleting twice is a not-found.
    let err = c.node(0).delete_container(&id, &alice()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_deleted_container_objects_are_collected() {
    let c = IntegrationCluster::new(3).await;
    let id = c.create_container(alice(), POLICY, BasicAcl::Private).await;

    let oid = c
        .node(0)
        .put_object(id, alice(), test_data(4096), None, BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(id, oid);
    assert_eq!(c.holders(0, addr).await.len(), 2);

    c.node(0).delete_container(&id, &alice()).await.unwrap();
    c.node(0).tick_epoch().await.unwrap();

    // The epoch change wakes every collector.
    let nodes = c.nodes();
    wait_until("objects collected", SETTLE, POLL_INTERVAL, move || async move {
        nodes
            .iter()
            .all(|n| n.meta().get_object(&addr).map(|h| h.is_none()).unwrap_or(false))
    })
    .await
    .unwrap();

    for node in c.nodes() {
        assert!(node.store().get(addr).await.unwrap().is_none());
    }
    assert!(c.holders(0, addr).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_container_created_during_isolation_arrives_after_heal() {
    let c = IntegrationCluster::new(4).await;
    c.block(3);

    let id = c
        .node(0)
        .create_container_with_policy(alice(), POLICY, BasicAcl::Private, None)
        .await
        .unwrap();
    assert!(c.node(3).get_container(&id).is_err());

    c.unblock(3);
    wait_for_container_creation(c.nodes(), id, SETTLE)
        .await
        .unwrap();
}

/// The lifecycle seen through a remote client, the way a gateway sees it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_lifecycle_through_remote_client() {
    let c = IntegrationCluster::new(3).await;
    let client = c.client(1);

    let id = client
        .create_container(alice(), POLICY, BasicAcl::Private, None)
        .await
        .unwrap();
    wait_for_container_creation(c.nodes(), id, SETTLE)
        .await
        .unwrap();
    assert_eq!(client.list_containers(alice()).await.unwrap(), vec![id]);

    let data = test_data(2048);
    let oid = client
        .put_object(id, alice(), data.clone(), None, BTreeMap::new())
        .await
        .unwrap();
    let addr = ObjectAddress::new(id, oid);

    let (header, payload) = c.client(2).get_object(addr, alice()).await.unwrap();
    assert_eq!(payload, data);
    assert_eq!(header.object_id, oid);

    let err = client.get_object(addr, bob()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    client.delete_container(id, alice()).await.unwrap();
    let err = client.get_container(id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_parallel_creation_and_deletion() {
    let c = IntegrationCluster::new(4).await;

    // One creation per node, all in flight at once.
    let mut creates = tokio::task::JoinSet::new();
    for (i, node) in c.nodes().iter().enumerate() {
        let node = node.clone();
        creates.spawn(async move {
            let name = Some(format!("c{i}"));
            node.create_container_with_policy(alice(), POLICY, BasicAcl::Private, name)
                .await
        });
    }
    let mut ids = Vec::new();
    while let Some(created) = creates.join_next().await {
        ids.push(created.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), c.len());

    for id in &ids {
        wait_for_container_creation(c.nodes(), *id, SETTLE)
            .await
            .unwrap();
    }
    for node in c.nodes() {
        assert_eq!(node.list_containers(&alice()).unwrap(), ids);
    }

    // Each container is deleted from a different node, again all at once.
    let mut deletes = tokio::task::JoinSet::new();
    for (node, id) in c.nodes().iter().zip(ids.iter().rev()) {
        let node = node.clone();
        let id = *id;
        deletes.spawn(async move { node.delete_container(&id, &alice()).await });
    }
    while let Some(deleted) = deletes.join_next().await {
        deleted.unwrap().unwrap();
    }

    let epoch = c.node(0).tick_epoch().await.unwrap();
    wait_for_epoch(c.nodes(), epoch, SETTLE).await.unwrap();
    for id in &ids {
        wait_for_container_deletion(c.nodes(), *id, SETTLE)
            .await
            .unwrap();
    }
    for node in c.nodes() {
        assert!(node.list_containers(&alice()).unwrap().is_empty());
    }
}
