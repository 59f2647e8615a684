//! Shared test harness for Reef integration tests.
//!
//! Provides [`IntegrationCluster`]: N full nodes wired over a [`SimNetwork`],
//! formed through a real join, with every background task running (health
//! probes, gossip, replication, garbage collection). Tests drive it through
//! the public node API and inject faults by blocking nodes on the network.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reef_engine::wait::{POLL_INTERVAL, wait_for_container_creation, wait_until};
use reef_engine::{EngineError, NodeTasks, ReefClient, ReefNode, ReefNodeConfig};
use reef_meta::MetaStore;
use reef_net::SimNetwork;
use reef_store::MemoryStore;
use reef_types::{BasicAcl, ContainerId, NodeId, NodeRecord, ObjectAddress, OwnerId};
use tracing::info;

/// Maximum store capacity for test nodes.
const MAX_BYTES: u64 = u64::MAX;

/// Network identity of clients created by [`IntegrationCluster::client`].
const CLIENT_ID: [u8; 32] = [0xEE; 32];

/// Upper bound for every convergence wait in the integration suite.
pub const SETTLE: Duration = Duration::from_secs(10);

/// A cluster of started nodes over a simulated network.
pub struct IntegrationCluster {
    net: SimNetwork,
    nodes: Vec<Arc<ReefNode>>,
    tasks: Vec<NodeTasks>,
}

impl IntegrationCluster {
    /// Create an `n`-node cluster of attribute-less nodes.
    pub async fn new(n: usize) -> Self {
        Self::with_attributes(vec![BTreeMap::new(); n]).await
    }

    /// Create one node per attribute map.
    ///
    /// Node `i` gets id `[i + 1; 32]`. Node 0 is the seed every other node
    /// joins through; the rest of the membership spreads by gossip. Returns
    /// once every node knows every other.
    pub async fn with_attributes(attributes: Vec<BTreeMap<String, String>>) -> Self {
        let n = attributes.len();
        assert!(n >= 1, "need at least 1 node");
        assert!(n < 255, "too many nodes");

        let net = SimNetwork::new();
        let mut nodes = Vec::with_capacity(n);
        for (i, attrs) in attributes.into_iter().enumerate() {
            let id = NodeId::from([i as u8 + 1; 32]);
            let mut record = NodeRecord::new(id, format!("sim://{}", i + 1));
            record.attributes = attrs;

            let node = ReefNode::new(
                ReefNodeConfig::test_config(),
                record,
                Arc::new(MetaStore::open_temporary().unwrap()),
                Arc::new(MemoryStore::new(MAX_BYTES)),
                net.transport(id),
            )
            .unwrap();
            net.register(id, Arc::downgrade(&node));
            nodes.push(node);
        }

        let seed = nodes[0].node_id();
        for node in &nodes[1..] {
            node.join(&[seed]).await.unwrap();
        }
        let tasks = nodes.iter().map(|node| node.start()).collect();

        let cluster = Self { net, nodes, tasks };
        cluster.wait_for_membership(SETTLE).await.unwrap();
        info!(nodes = n, "integration cluster formed");
        cluster
    }

    /// Get a reference to node `i`.
    pub fn node(&self, i: usize) -> &Arc<ReefNode> {
        &self.nodes[i]
    }

    /// All nodes, in index order.
    pub fn nodes(&self) -> &[Arc<ReefNode>] {
        &self.nodes
    }

    /// Get the node ID of node `i`.
    pub fn node_id(&self, i: usize) -> NodeId {
        self.nodes[i].node_id()
    }

    /// Index of the node with id `id`.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_id() == id)
    }

    /// Number of nodes in the cluster.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A remote client of node `i`, as a gateway would hold it.
    pub fn client(&self, i: usize) -> ReefClient {
        ReefClient::new(self.net.transport(NodeId::from(CLIENT_ID)), self.node_id(i))
    }

    /// Drop all traffic to and from node `i`.
    pub fn block(&self, i: usize) {
        info!(node = %self.node_id(i), "blocking node");
        self.net.block(self.node_id(i));
    }

    /// Restore traffic to and from node `i`.
    pub fn unblock(&self, i: usize) {
        info!(node = %self.node_id(i), "unblocking node");
        self.net.unblock(self.node_id(i));
    }

    /// Indices of the nodes that are not blocked.
    pub fn live(&self) -> Vec<usize> {
        (0..self.len())
            .filter(|&i| !self.net.is_blocked(&self.node_id(i)))
            .collect()
    }

    /// Wait until every node knows every other node.
    pub async fn wait_for_membership(&self, timeout: Duration) -> Result<(), EngineError> {
        let nodes = &self.nodes;
        let total = nodes.len();
        wait_until("full membership", timeout, POLL_INTERVAL, move || async move {
            for node in nodes {
                if node.cluster().node_count().await != total {
                    return false;
                }
            }
            true
        })
        .await
    }

    /// Wait until every unblocked node other than `i` considers `i`
    /// reachable (`reachable = true`) or unreachable (`false`).
    pub async fn wait_for_reachability(
        &self,
        i: usize,
        reachable: bool,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let target = self.node_id(i);
        let observers: Vec<&Arc<ReefNode>> = self
            .live()
            .into_iter()
            .filter(|&j| j != i)
            .map(|j| &self.nodes[j])
            .collect();
        let observers = &observers;
        wait_until(
            &format!("node {target} reachable={reachable}"),
            timeout,
            POLL_INTERVAL,
            move || async move {
                for node in observers {
                    if node.cluster().is_reachable(&target).await != reachable {
                        return false;
                    }
                }
                true
            },
        )
        .await
    }

    /// Create a container on node 0 and wait until every node knows it.
    pub async fn create_container(
        &self,
        owner: OwnerId,
        policy: &str,
        acl: BasicAcl,
    ) -> ContainerId {
        let id = self.nodes[0]
            .create_container_with_policy(owner, policy, acl, None)
            .await
            .unwrap();
        wait_for_container_creation(&self.nodes, id, SETTLE)
            .await
            .unwrap();
        id
    }

    /// Live replica holders of `address` as seen from node `observer`.
    pub async fn holders(&self, observer: usize, address: ObjectAddress) -> Vec<NodeId> {
        self.nodes[observer]
            .replica_holders(address)
            .await
            .unwrap_or_default()
    }

    /// Wait until node `observer` sees at least `copies` holders of
    /// `address`, none of them in `excluded`. Returns the holders.
    pub async fn wait_for_holders(
        &self,
        observer: usize,
        address: ObjectAddress,
        copies: usize,
        excluded: &[NodeId],
        timeout: Duration,
    ) -> Result<Vec<NodeId>, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let holders = self.holders(observer, address).await;
            if holders.len() >= copies && !holders.iter().any(|h| excluded.contains(h)) {
                return Ok(holders);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Timeout(format!(
                    "{copies} replicas of {address} outside {excluded:?}, last seen {holders:?}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        for tasks in &self.tasks {
            tasks.shutdown();
        }
    }
}

impl Drop for IntegrationCluster {
    fn drop(&mut self) {
        for tasks in &self.tasks {
            tasks.abort();
        }
    }
}

/// A fixed owner.
pub fn alice() -> OwnerId {
    OwnerId::from_data(b"alice")
}

/// Another owner.
pub fn bob() -> OwnerId {
    OwnerId::from_data(b"bob")
}

/// Generate deterministic, non-repeating test data.
pub fn test_data(size: usize) -> Bytes {
    test_data_seeded(size, 0xDEAD_BEEF)
}

/// Generate test data with a specific seed (for unique objects).
pub fn test_data_seeded(size: usize, seed: u32) -> Bytes {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    Bytes::from(data)
}
