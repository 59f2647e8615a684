//! Integration test: placement policies across a cluster.
//!
//! Filters and selectors pick nodes by their attributes, every node computes
//! the same placement, and a container reports back the policy it was
//! created with.

use std::collections::BTreeMap;

use reef_engine::placement_policy_from_info;
use reef_integration_tests::{IntegrationCluster, alice, test_data_seeded};
use reef_placement::parse_rule;
use reef_types::events::ObjectStored;
use reef_types::{BasicAcl, ErrorKind, ObjectAddress};

fn city(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("City".to_string(), name.to_string())])
}

/// Three nodes in Oslo, three in Bergen.
async fn two_city_cluster() -> IntegrationCluster {
    let mut attributes = Vec::new();
    for _ in 0..3 {
        attributes.push(city("Oslo"));
        attributes.push(city("Bergen"));
    }
    IntegrationCluster::with_attributes(attributes).await
}

fn city_of(c: &IntegrationCluster, id: reef_types::NodeId) -> String {
    let i = c.index_of(id).expect("holder is a cluster node");
    c.node(i).cluster().local_record().attributes["City"].clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_filter_restricts_holders() {
    let c = two_city_cluster().await;
    let cid = c
        .create_container(
            alice(),
            "REP 2 IN X SELECT 2 FROM F AS X FILTER City EQ Oslo AS F",
            BasicAcl::Private,
        )
        .await;

    for i in 0..10u32 {
        let writer = i as usize % c.len();
        let oid = c
            .node(writer)
            .put_object(cid, alice(), test_data_seeded(300, i + 1), None, BTreeMap::new())
            .await
            .unwrap();
        let holders = c.holders(writer, ObjectAddress::new(cid, oid)).await;
        assert_eq!(holders.len(), 2);
        for holder in holders {
            assert_eq!(city_of(&c, holder), "Oslo");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_one_replica_per_city() {
    let c = two_city_cluster().await;
    let cid = c
        .create_container(
            alice(),
            "REP 1 IN OSL REP 1 IN BGO \
             SELECT 1 FROM OSLO AS OSL SELECT 1 FROM BERGEN AS BGO \
             FILTER City EQ Oslo AS OSLO FILTER City EQ Bergen AS BERGEN",
            BasicAcl::Private,
        )
        .await;
    let mut stored = c.node(1).events().subscribe::<ObjectStored>();

    c.node(1)
        .put_object(cid, alice(), test_data_seeded(1000, 7), None, BTreeMap::new())
        .await
        .unwrap();

    let event = stored.try_recv().unwrap();
    let mut cities: Vec<String> = event.holders.iter().map(|h| city_of(&c, *h)).collect();
    cities.sort();
    assert_eq!(cities, vec!["Bergen", "Oslo"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_distinct_selector_spreads_across_cities() {
    let c = two_city_cluster().await;
    let cid = c
        .create_container(
            alice(),
            "REP 2 IN X SELECT 2 IN DISTINCT City FROM * AS X",
            BasicAcl::Private,
        )
        .await;

    for i in 0..5u32 {
        let oid = c
            .node(0)
            .put_object(cid, alice(), test_data_seeded(128, 100 + i), None, BTreeMap::new())
            .await
            .unwrap();
        let holders = c.holders(0, ObjectAddress::new(cid, oid)).await;
        let mut cities: Vec<String> = holders.iter().map(|h| city_of(&c, *h)).collect();
        cities.sort();
        assert_eq!(cities, vec!["Bergen", "Oslo"]);
    }
}

/// A filter nothing satisfies makes every write fail, whichever node takes it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_unsatisfiable_filter_rejects_writes() {
    let c = two_city_cluster().await;
    let cid = c
        .create_container(
            alice(),
            "REP 1 IN X SELECT 1 FROM F AS X FILTER City EQ Tromso AS F",
            BasicAcl::Private,
        )
        .await;

    for i in 0..c.len() {
        let err = c
            .node(i)
            .put_object(cid, alice(), test_data_seeded(10, 1), None, BTreeMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientNodes);
    }
}

/// Container info, read on another node, reports the policy the container
/// was created with, up to keyword case.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_container_info_reports_creation_policy() {
    let c = IntegrationCluster::new(3).await;

    for policy in [
        "rep 2 in X cbf 1 select 2 from * as X",
        "REP 2 IN X CBF 2 SELECT 2 FROM * AS X",
        "REP 1 IN A REP 2 IN B CBF 1 SELECT 1 FROM F AS A SELECT 2 IN DISTINCT City FROM * AS B \
         FILTER Country EQ NO AS F",
        "REP 1 IN X CBF 1 SELECT 1 FROM F AS X \
         FILTER (City EQ \"Saint Petersburg\" OR City EQ Oslo) AND Tier EQ 1 AS F",
    ] {
        let cid = c.create_container(alice(), policy, BasicAcl::Private).await;
        let info = c.node(2).container_info(&cid).unwrap().to_string();

        assert!(info.contains(&format!("container ID: {cid}")));
        assert!(info.contains(&format!("owner ID: {}", alice())));

        let reported = placement_policy_from_info(&info).expect("info has a policy section");
        assert!(
            reported.eq_ignore_ascii_case(policy),
            "reported {reported:?} for {policy:?}"
        );
        assert_eq!(parse_rule(&reported).unwrap(), parse_rule(policy).unwrap());
    }
}
