//! [`ReefNode`]: the node orchestrator that ties all components together.
//!
//! A `ReefNode` owns the local payload store, the metadata store, the cluster
//! view, the epoch clock and the transport. It exposes the object write and
//! read paths; the container registry lives in [`crate::registry`] and the
//! inbound protocol in `handler`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reef_cluster::health::{self, HealthHandle};
use reef_cluster::{
    ClusterState, EpochClock, GossipConfig, GossipHandle, GossipState, HealthConfig,
    HealthMonitor, gossip,
};
use reef_gc::{GarbageCollector, GcConfig, GcHandle, GcSummary};
use reef_meta::MetaStore;
use reef_net::{MAX_PAYLOAD_SIZE, ReefMessage, Transport, TransportExt};
use reef_placement::resolve;
use reef_replication::{ReconcileSummary, Replicator, ReplicatorConfig, ReplicatorHandle};
use reef_store::{PayloadStore, RecordLocks};
use reef_types::events::{EventBus, ObjectStored};
use reef_types::{
    ClusterEvent, ContainerId, ContainerRecord, Epoch, NodeId, NodeRecord, ObjectAddress,
    ObjectHeader, ObjectId, OwnerId,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Configuration for creating a [`ReefNode`].
#[derive(Debug, Clone)]
pub struct ReefNodeConfig {
    /// Peer probing.
    pub health: HealthConfig,
    /// Anti-entropy.
    pub gossip: GossipConfig,
    /// Background replica restoration.
    pub replication: ReplicatorConfig,
    /// Garbage collection.
    pub gc: GcConfig,
    /// Bound on a single replica push or fetch.
    pub request_timeout: Duration,
}

impl ReefNodeConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            health: HealthConfig::test_config(),
            gossip: GossipConfig::test_config(),
            replication: ReplicatorConfig::test_config(),
            gc: GcConfig::test_config(),
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            health: HealthConfig::default_config(),
            gossip: GossipConfig::default_config(),
            replication: ReplicatorConfig::default_config(),
            gc: GcConfig::default_config(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ReefNodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// A Reef storage node.
pub struct ReefNode {
    pub(crate) config: ReefNodeConfig,
    pub(crate) cluster: Arc<ClusterState>,
    pub(crate) clock: Arc<EpochClock>,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) store: Arc<dyn PayloadStore>,
    pub(crate) locks: Arc<RecordLocks>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: EventBus,
    health: Arc<HealthMonitor>,
    replicator: Arc<Replicator>,
    gc: Arc<GarbageCollector>,
}

impl ReefNode {
    /// Build a node around its stores and transport.
    ///
    /// The epoch is restored from `meta`, so a restarted node never goes
    /// back in time. Nothing runs until [`ReefNode::start`].
    pub fn new(
        config: ReefNodeConfig,
        local: NodeRecord,
        meta: Arc<MetaStore>,
        store: Arc<dyn PayloadStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, EngineError> {
        let clock = Arc::new(EpochClock::restore(meta.clone())?);
        let cluster = ClusterState::new(local);
        let locks = Arc::new(RecordLocks::default());
        let events = EventBus::new();

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            cluster.clone(),
            clock.clone(),
            transport.clone(),
            Some(meta.clone()),
        ));
        let replicator = Arc::new(Replicator::new(
            config.replication.clone(),
            cluster.clone(),
            clock.clone(),
            meta.clone(),
            store.clone(),
            locks.clone(),
            transport.clone(),
            events.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            config.gc.clone(),
            clock.clone(),
            meta.clone(),
            store.clone(),
            locks.clone(),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            cluster,
            clock,
            meta,
            store,
            locks,
            transport,
            events,
            health,
            replicator,
            gc,
        }))
    }

    /// Re-add the members persisted by a previous run.
    ///
    /// They come back as `Healthy` and are re-judged by the health monitor.
    pub async fn restore_members(&self) -> Result<usize, EngineError> {
        let mut restored = 0;
        for member in self.meta.list_members()? {
            if self.cluster.add_node(member).await {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Join the cluster through `seeds`.
    pub async fn join(&self, seeds: &[NodeId]) -> Result<usize, EngineError> {
        let answered =
            gossip::join(&self.cluster, &self.clock, self.transport.as_ref(), seeds).await?;
        for peer in self.cluster.peers().await {
            self.meta.put_member(&peer)?;
        }
        Ok(answered)
    }

    /// Start the health monitor, gossip, replicator and garbage collector.
    pub fn start(self: &Arc<Self>) -> NodeTasks {
        let state: Arc<dyn GossipState> = self.clone();
        let tasks = NodeTasks {
            health: health::spawn(self.health.clone()),
            gossip: gossip::start(
                self.config.gossip.clone(),
                self.cluster.clone(),
                self.transport.clone(),
                state,
            ),
            replicator: reef_replication::replicator::start(self.replicator.clone()),
            gc: reef_gc::start(self.gc.clone()),
        };
        info!(node = %self.node_id(), "node started");
        tasks
    }

    /// Return this node's ID.
    pub fn node_id(&self) -> NodeId {
        self.cluster.local_node_id()
    }

    /// Return a reference to the cluster state.
    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    /// Return a reference to the epoch clock.
    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    /// Return a reference to the metadata store.
    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// Return a reference to the payload store.
    pub fn store(&self) -> &Arc<dyn PayloadStore> {
        &self.store
    }

    /// Return the node's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one probe round against every known peer.
    pub async fn probe_peers(&self) {
        self.health.probe_round().await;
    }

    /// Run one replica reconciliation pass.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, EngineError> {
        Ok(self.replicator.reconcile_once().await?)
    }

    /// Run one garbage collection pass.
    pub async fn collect_garbage(&self) -> Result<GcSummary, EngineError> {
        Ok(self.gc.sweep().await?)
    }

    /// Number of garbage collection passes completed so far.
    pub fn gc_passes(&self) -> u64 {
        self.gc.passes()
    }

    // ------------------------------------------------------------------
    // Epoch
    // ------------------------------------------------------------------

    /// The node's current epoch.
    pub fn current_epoch(&self) -> Epoch {
        self.clock.current()
    }

    /// Advance the epoch and announce it to every reachable peer.
    pub async fn tick_epoch(&self) -> Result<Epoch, EngineError> {
        let epoch = self.clock.tick()?;
        self.cluster.emit(ClusterEvent::EpochAdvanced(epoch));
        self.broadcast(ReefMessage::EpochAnnounce { epoch }).await;
        Ok(epoch)
    }

    /// Adopt a peer's epoch if it is ahead.
    pub(crate) fn observe_epoch(&self, epoch: Epoch) {
        match self.clock.observe(epoch) {
            Ok(true) => self.cluster.emit(ClusterEvent::EpochAdvanced(epoch)),
            Ok(false) => {}
            Err(e) => warn!(%e, epoch, "failed to adopt peer epoch"),
        }
    }

    /// Send `msg` one-way to every reachable peer.
    pub(crate) async fn broadcast(&self, msg: ReefMessage) {
        for peer in self.cluster.reachable_peers().await {
            if let Err(e) = self.transport.send_to(peer, &msg).await {
                debug!(%peer, %e, kind = msg.kind(), "broadcast delivery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Store an object: stamp the header, resolve the placement, and write
    /// replicas in HRW order until every `REP` vector has its copies.
    ///
    /// Primaries that fail are replaced by the vector's backup-factor nodes.
    /// Returns [`EngineError::PlacementFailed`] if a vector runs out of nodes,
    /// after removing the copies this call created, so a failed write leaves
    /// nothing readable behind.
    #[tracing::instrument(skip(self, payload, attributes), fields(size = payload.len()))]
    pub async fn put_object(
        &self,
        container_id: ContainerId,
        owner: OwnerId,
        payload: Bytes,
        expire_at: Option<Epoch>,
        attributes: BTreeMap<String, String>,
    ) -> Result<ObjectId, EngineError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EngineError::InvalidRequest(format!(
                "payload of {} bytes exceeds the limit of {MAX_PAYLOAD_SIZE}",
                payload.len()
            )));
        }
        let record = self.live_container(&container_id)?;
        let container = &record.container;
        if !container
            .basic_acl
            .allows_write(container.is_owner(&owner))
        {
            return Err(EngineError::Forbidden(format!(
                "write to container {container_id}"
            )));
        }

        let epoch = self.clock.current();
        if let Some(expire_at) = expire_at
            && expire_at < epoch
        {
            return Err(EngineError::InvalidRequest(format!(
                "expiration epoch {expire_at} is before the current epoch {epoch}"
            )));
        }

        let header = ObjectHeader::new(
            container_id,
            owner,
            &payload,
            epoch,
            expire_at,
            attributes,
        );
        let addr = header.address();

        let candidates = self.cluster.candidates().await;
        let placement = resolve(&container.placement_policy, &candidates, &container_id)?
            .for_object(&header.object_id);
        let needed = placement.required_copies();

        let mut acked: Vec<NodeId> = Vec::with_capacity(needed);
        // Nodes that did not hold the object before this write.
        let mut created: Vec<NodeId> = Vec::new();
        for vector in placement.vectors() {
            let wanted = vector.replicas as usize;
            // A node that already holds the object counts for every vector
            // it belongs to.
            let mut got = vector.nodes.iter().filter(|n| acked.contains(n)).count();

            for &target in &vector.nodes {
                if got >= wanted {
                    break;
                }
                if acked.contains(&target) {
                    continue;
                }
                match self.write_replica(target, &record, &header, &payload).await {
                    Ok(fresh) => {
                        debug!(%addr, %target, fresh, "replica acknowledged");
                        acked.push(target);
                        if fresh {
                            created.push(target);
                        }
                        got += 1;
                    }
                    Err(e) => warn!(%addr, %target, %e, "replica write failed, trying next node"),
                }
            }

            if got < wanted {
                warn!(%addr, needed, acked = acked.len(), "write quorum not reached");
                self.roll_back(addr, &created).await;
                return Err(EngineError::PlacementFailed {
                    needed,
                    acked: acked.len(),
                });
            }
        }

        self.meta.put_replicas(&addr, &acked)?;
        info!(%addr, holders = acked.len(), "object stored");
        self.events.emit(ObjectStored {
            address: addr,
            holders: acked,
        });
        Ok(header.object_id)
    }

    async fn write_replica(
        &self,
        target: NodeId,
        record: &ContainerRecord,
        header: &ObjectHeader,
        payload: &Bytes,
    ) -> Result<bool, EngineError> {
        if target == self.node_id() {
            return self.store_local(header, payload.clone()).await;
        }
        let push = self.transport.push_replica(
            target,
            Some(record.clone()),
            header.clone(),
            payload.clone(),
        );
        match tokio::time::timeout(self.config.request_timeout, push).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout(format!("replica push to {target}"))),
        }
    }

    /// Undo the copies a failed write created.
    ///
    /// Copies that existed before the write are left alone. Peers that
    /// cannot be reached keep their copy until garbage collection or a later
    /// write of the same object.
    async fn roll_back(&self, addr: ObjectAddress, created: &[NodeId]) {
        for &node in created {
            let result = if node == self.node_id() {
                self.discard_local(addr).await
            } else {
                let request = self.transport.drop_replica(node, addr);
                match tokio::time::timeout(self.config.request_timeout, request).await {
                    Ok(result) => result.map_err(EngineError::from),
                    Err(_) => Err(EngineError::Timeout(format!("replica drop on {node}"))),
                }
            };
            match result {
                Ok(_) => debug!(%addr, %node, "rolled back replica"),
                Err(e) => warn!(%addr, %node, %e, "failed to roll back replica"),
            }
        }
    }

    /// Store a verified replica locally under its record lock.
    ///
    /// Returns `true` if the node did not hold the object before.
    pub(crate) async fn store_local(
        &self,
        header: &ObjectHeader,
        payload: Bytes,
    ) -> Result<bool, EngineError> {
        let addr = header.address();
        let _guard = self.locks.lock(&addr).await;
        let fresh = self.meta.get_object(&addr)?.is_none();
        self.store.put(addr, payload).await?;
        self.meta.put_object(header)?;
        self.meta.add_replica(&addr, self.node_id())?;
        Ok(fresh)
    }

    /// Remove the local copy of `addr` under its record lock.
    ///
    /// Returns whether there was one.
    pub(crate) async fn discard_local(&self, addr: ObjectAddress) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(&addr).await;
        let present = self.meta.get_object(&addr)?.is_some();
        self.store.delete(addr).await?;
        self.meta.remove_object(&addr)?;
        self.meta.remove_replicas(&addr)?;
        Ok(present)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Retrieve an object's header and payload.
    ///
    /// The local copy is tried first, then reachable peers in placement
    /// order, then known holders, then every other reachable node. An
    /// integrity failure ends the read at once.
    #[tracing::instrument(skip(self))]
    pub async fn get_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<(ObjectHeader, Bytes), EngineError> {
        let record = self.live_container(&address.container_id)?;
        let container = &record.container;
        if !container
            .basic_acl
            .allows_read(container.is_owner(&requester))
        {
            return Err(EngineError::Forbidden(format!("read of {address}")));
        }

        let (header, payload) = self.locate(&record, address).await?;
        if header.is_expired(self.clock.current()) {
            debug!(%address, "object expired, reporting not found");
            return Err(EngineError::ObjectNotFound(address));
        }
        Ok((header, payload))
    }

    /// Retrieve an object's header.
    pub async fn head_object(
        &self,
        address: ObjectAddress,
        requester: OwnerId,
    ) -> Result<ObjectHeader, EngineError> {
        self.get_object(address, requester)
            .await
            .map(|(header, _)| header)
    }

    async fn locate(
        &self,
        record: &ContainerRecord,
        address: ObjectAddress,
    ) -> Result<(ObjectHeader, Bytes), EngineError> {
        if let Some(replica) = self.read_local(address).await? {
            check_integrity(address, &replica.0, &replica.1)?;
            return Ok(replica);
        }

        for peer in self.read_order(record, address).await? {
            let fetch = self.transport.pull_replica(peer, address);
            match tokio::time::timeout(self.config.request_timeout, fetch).await {
                Ok(Ok(Some((header, payload)))) => {
                    check_integrity(address, &header, &payload)?;
                    debug!(%address, %peer, "object read from peer");
                    return Ok((header, payload));
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(%address, %peer, %e, "replica fetch failed"),
                Err(_) => debug!(%address, %peer, "replica fetch timed out"),
            }
        }

        Err(EngineError::ObjectNotFound(address))
    }

    /// The local header and payload, if both are present.
    pub(crate) async fn read_local(
        &self,
        address: ObjectAddress,
    ) -> Result<Option<(ObjectHeader, Bytes)>, EngineError> {
        let Some(header) = self.meta.get_object(&address)? else {
            return Ok(None);
        };
        Ok(self
            .store
            .get(address)
            .await?
            .map(|payload| (header, payload)))
    }

    /// Peers to ask for `address`, most likely holders first.
    async fn read_order(
        &self,
        record: &ContainerRecord,
        address: ObjectAddress,
    ) -> Result<Vec<NodeId>, EngineError> {
        let local = self.node_id();
        let reachable = self.cluster.reachable_peers().await;
        let mut order: Vec<NodeId> = Vec::with_capacity(reachable.len());
        let push = |node: NodeId, order: &mut Vec<NodeId>| {
            if node != local && reachable.contains(&node) && !order.contains(&node) {
                order.push(node);
            }
        };

        let candidates = self.cluster.candidates().await;
        if let Ok(placement) = resolve(
            &record.container.placement_policy,
            &candidates,
            &address.container_id,
        ) {
            for node in placement.for_object(&address.object_id).nodes() {
                push(node, &mut order);
            }
        }
        for node in self.meta.get_replicas(&address)?.unwrap_or_default() {
            push(node, &mut order);
        }
        for &node in &reachable {
            push(node, &mut order);
        }
        Ok(order)
    }

    /// The live replica set: this node if it holds a copy, plus every
    /// reachable peer that confirms holding one. Sorted by node ID.
    pub async fn replica_holders(
        &self,
        address: ObjectAddress,
    ) -> Result<Vec<NodeId>, EngineError> {
        let mut holders = Vec::new();
        if self.read_local(address).await?.is_some() {
            holders.push(self.node_id());
        }

        let mut probes = JoinSet::new();
        for peer in self.cluster.reachable_peers().await {
            let transport = self.transport.clone();
            let timeout = self.config.request_timeout;
            probes.spawn(async move {
                let present =
                    tokio::time::timeout(timeout, transport.has_replica(peer, address)).await;
                (peer, matches!(present, Ok(Ok(true))))
            });
        }
        while let Some(joined) = probes.join_next().await {
            if let Ok((peer, true)) = joined {
                holders.push(peer);
            }
        }

        holders.sort();
        Ok(holders)
    }
}

/// Verify a replica against the address it was requested for.
fn check_integrity(
    address: ObjectAddress,
    header: &ObjectHeader,
    payload: &[u8],
) -> Result<(), EngineError> {
    if header.address() != address || !header.verify_id() {
        return Err(EngineError::DataCorruption {
            address,
            reason: "header does not match the object id".into(),
        });
    }
    if !header.verify_payload(payload) {
        return Err(EngineError::DataCorruption {
            address,
            reason: "payload hash mismatch".into(),
        });
    }
    Ok(())
}

/// Handles to a node's background tasks.
pub struct NodeTasks {
    /// Peer probing.
    pub health: HealthHandle,
    /// Anti-entropy.
    pub gossip: GossipHandle,
    /// Replica restoration.
    pub replicator: ReplicatorHandle,
    /// Garbage collection.
    pub gc: GcHandle,
}

impl NodeTasks {
    /// Ask every task to stop.
    pub fn shutdown(&self) {
        self.health.shutdown();
        self.gossip.shutdown();
        self.replicator.shutdown();
        self.gc.shutdown();
    }

    /// Abort every task.
    pub fn abort(&self) {
        self.health.abort();
        self.gossip.abort();
        self.replicator.abort();
        self.gc.abort();
    }

    /// Whether every task is still running.
    pub fn is_running(&self) -> bool {
        self.health.is_running()
            && self.gossip.is_running()
            && self.replicator.is_running()
            && self.gc.is_running()
    }
}
