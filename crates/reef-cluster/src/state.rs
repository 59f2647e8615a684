//! Cluster state: the local view of every known node.
//!
//! [`ClusterState`] is the shared, read-mostly structure other components
//! (placement, replication, the engine) consult to learn which nodes exist
//! and which of them are reachable. Node health is only ever changed by this
//! node's health monitor.

use std::collections::HashMap;
use std::sync::Arc;

use reef_types::{ClusterEvent, NodeId, NodeRecord, NodeState};
use tokio::sync::{RwLock, broadcast};
use tracing::info;

/// Shared cluster view.
pub struct ClusterState {
    /// Known peers, keyed by node ID. The local node is kept apart.
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
    /// This node's record. Always `Healthy` from its own point of view.
    local: NodeRecord,
    /// Broadcast channel for cluster events.
    event_tx: broadcast::Sender<ClusterEvent>,
}

impl ClusterState {
    /// Create the view for the given local node.
    pub fn new(mut local: NodeRecord) -> Arc<Self> {
        local.state = NodeState::Healthy;
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            local,
            event_tx,
        })
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.event_tx.subscribe()
    }

    /// Publish an event to every subscriber.
    pub fn emit(&self, event: ClusterEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Return this node's ID.
    pub fn local_node_id(&self) -> NodeId {
        self.local.node_id
    }

    /// Return this node's record.
    pub fn local_record(&self) -> &NodeRecord {
        &self.local
    }

    /// Learn about a node.
    ///
    /// An unknown node is added as `Healthy` and announced with
    /// [`ClusterEvent::NodeJoined`]. For a known node only the endpoint and
    /// attributes are refreshed: health stays whatever local probing decided.
    /// Returns whether the node was new.
    pub async fn add_node(&self, mut record: NodeRecord) -> bool {
        if record.node_id == self.local.node_id {
            return false;
        }
        let mut nodes = self.nodes.write().await;
        if let Some(known) = nodes.get_mut(&record.node_id) {
            known.endpoint = record.endpoint;
            known.attributes = record.attributes;
            return false;
        }

        record.state = NodeState::Healthy;
        nodes.insert(record.node_id, record.clone());
        drop(nodes);

        info!(node_id = %record.node_id, "node joined cluster view");
        self.emit(ClusterEvent::NodeJoined(record));
        true
    }

    /// Change the health of a peer, returning its previous state.
    ///
    /// Leaving `Unreachable` emits [`ClusterEvent::NodeReturned`]; entering it
    /// emits [`ClusterEvent::NodeUnreachable`].
    pub async fn set_state(&self, node_id: &NodeId, state: NodeState) -> Option<NodeState> {
        let previous = {
            let mut nodes = self.nodes.write().await;
            let record = nodes.get_mut(node_id)?;
            std::mem::replace(&mut record.state, state)
        };

        if previous != state {
            info!(%node_id, from = ?previous, to = ?state, "node state changed");
            match (previous, state) {
                (_, NodeState::Unreachable) => {
                    self.emit(ClusterEvent::NodeUnreachable(*node_id));
                }
                (NodeState::Unreachable, _) => {
                    self.emit(ClusterEvent::NodeReturned(*node_id));
                }
                _ => {}
            }
        }
        Some(previous)
    }

    /// Return a specific peer.
    pub async fn get_node(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Return every known peer, in node-id order.
    pub async fn peers(&self) -> Vec<NodeRecord> {
        let mut peers: Vec<NodeRecord> = self.nodes.read().await.values().cloned().collect();
        peers.sort_by_key(|n| n.node_id);
        peers
    }

    /// Return the ids of peers not currently `Unreachable`.
    pub async fn reachable_peers(&self) -> Vec<NodeId> {
        self.peers()
            .await
            .into_iter()
            .filter(NodeRecord::reachable)
            .map(|n| n.node_id)
            .collect()
    }

    /// Every node, the local one included: the candidate set for placement.
    pub async fn candidates(&self) -> Vec<NodeRecord> {
        let mut all = self.peers().await;
        all.push(self.local.clone());
        all
    }

    /// Whether `node_id` is the local node or a reachable peer.
    pub async fn is_reachable(&self, node_id: &NodeId) -> bool {
        *node_id == self.local.node_id
            || self
                .nodes
                .read()
                .await
                .get(node_id)
                .is_some_and(NodeRecord::reachable)
    }

    /// Number of known nodes, the local one included.
    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len() + 1
    }
}
