//! Shared test utilities for reef-engine tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reef_meta::MetaStore;
use reef_net::SimNetwork;
use reef_store::MemoryStore;
use reef_types::{BasicAcl, ContainerId, NodeId, NodeRecord, OwnerId};

use crate::node::{ReefNode, ReefNodeConfig};

pub const TEST_MAX_BYTES: u64 = 1_000_000_000;

/// Upper bound for convergence waits.
pub const SETTLE: Duration = Duration::from_secs(3);

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Bytes {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = 0xDEAD_BEEF;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    Bytes::from(data)
}

pub fn alice() -> OwnerId {
    OwnerId::from_data(b"alice")
}

pub fn bob() -> OwnerId {
    OwnerId::from_data(b"bob")
}

/// Nodes wired together over a [`SimNetwork`], each knowing all the others.
pub struct TestCluster {
    pub net: SimNetwork,
    pub nodes: Vec<Arc<ReefNode>>,
}

impl TestCluster {
    pub fn node(&self, i: usize) -> &Arc<ReefNode> {
        &self.nodes[i]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id()).collect()
    }

    /// Create a container owned by alice on node 0.
    pub async fn container(&self, policy: &str, acl: BasicAcl) -> ContainerId {
        self.nodes[0]
            .create_container_with_policy(alice(), policy, acl, None)
            .await
            .unwrap()
    }
}

/// Build `n` nodes with ids `[1; 32]`, `[2; 32]`, ...
pub async fn cluster(n: u8) -> TestCluster {
    let net = SimNetwork::new();
    let mut nodes = Vec::with_capacity(n as usize);

    for i in 1..=n {
        let id = NodeId::from([i; 32]);
        let node = ReefNode::new(
            ReefNodeConfig::test_config(),
            NodeRecord::new(id, format!("sim://{i}")),
            Arc::new(MetaStore::open_temporary().unwrap()),
            Arc::new(MemoryStore::new(TEST_MAX_BYTES)),
            net.transport(id),
        )
        .unwrap();
        net.register(id, Arc::downgrade(&node));
        nodes.push(node);
    }

    for node in &nodes {
        for other in &nodes {
            node.cluster()
                .add_node(other.cluster().local_record().clone())
                .await;
        }
    }

    TestCluster { net, nodes }
}
