//! Background replica reconciliation.
//!
//! Each pass visits every object held locally. Expired objects and objects of
//! deleted containers are skipped (they belong to the garbage collector).
//! For the rest, the container's policy is resolved against the current
//! reachable view, the first `count` nodes of each vector form the desired
//! set, and every desired peer that answers `HasReplica` negatively receives
//! a copy. Copies on nodes outside the desired set are left alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reef_cluster::{ClusterState, EpochClock};
use reef_meta::MetaStore;
use reef_net::{Transport, TransportExt};
use reef_placement::{Placement, PlacementError, resolve};
use reef_store::{PayloadStore, RecordLocks};
use reef_types::events::{EventBus, ReplicaCorrupted, ReplicaRestored};
use reef_types::{ClusterEvent, ContainerId, ContainerRecord, NodeRecord, ObjectHeader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::ReplicationError;
use crate::throttle::Throttle;

/// Configuration for the [`Replicator`].
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Interval between periodic passes.
    pub interval: Duration,
    /// Bandwidth budget for pushes, bytes per second.
    pub bytes_per_sec: u64,
    /// Time limit for one presence check or one push.
    pub request_timeout: Duration,
}

impl ReplicatorConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            interval: Duration::from_millis(200),
            bytes_per_sec: 64 * 1024 * 1024,
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            interval: Duration::from_secs(10),
            bytes_per_sec: 50 * 1024 * 1024,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Objects whose placement was checked.
    pub objects_checked: usize,
    /// Copies pushed to desired nodes that lacked one.
    pub replicas_created: usize,
    /// Objects whose policy cannot be satisfied by the reachable nodes.
    pub degraded: usize,
    /// Local copies that failed their integrity check.
    pub corrupt: usize,
    /// Probes, pushes or local lookups that failed.
    pub failed: usize,
}

/// Per-container resolution, computed once per pass.
enum Resolved {
    /// Unknown or deleted container: nothing to reconcile.
    Skip,
    /// The reachable nodes cannot satisfy the policy.
    Degraded,
    /// The container and its placement.
    Ready(ContainerRecord, Placement),
}

/// Restores missing replicas of locally held objects.
pub struct Replicator {
    config: ReplicatorConfig,
    cluster: Arc<ClusterState>,
    clock: Arc<EpochClock>,
    meta: Arc<MetaStore>,
    store: Arc<dyn PayloadStore>,
    locks: Arc<RecordLocks>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    throttle: Arc<Throttle>,
}

impl Replicator {
    /// Create a replicator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReplicatorConfig,
        cluster: Arc<ClusterState>,
        clock: Arc<EpochClock>,
        meta: Arc<MetaStore>,
        store: Arc<dyn PayloadStore>,
        locks: Arc<RecordLocks>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let throttle = Throttle::new(config.bytes_per_sec);
        Self {
            config,
            cluster,
            clock,
            meta,
            store,
            locks,
            transport,
            events,
            throttle,
        }
    }

    /// Run one reconciliation pass over every locally held object.
    #[tracing::instrument(skip(self), fields(node = %self.cluster.local_node_id()))]
    pub async fn reconcile_once(&self) -> Result<ReconcileSummary, ReplicationError> {
        let mut summary = ReconcileSummary::default();
        let current = self.clock.current();
        let candidates = self.cluster.candidates().await;
        let mut placements: HashMap<ContainerId, Resolved> = HashMap::new();

        for header in self.meta.list_objects()? {
            if header.is_expired(current) {
                continue;
            }

            let cid = header.container_id;
            if !placements.contains_key(&cid) {
                let resolved = self.resolve_container(&cid, &candidates).unwrap_or_else(|e| {
                    warn!(container = %cid, %e, "failed to load container, skipping its objects");
                    summary.failed += 1;
                    Resolved::Skip
                });
                placements.insert(cid, resolved);
            }
            match placements.get(&cid) {
                Some(Resolved::Ready(record, placement)) => {
                    summary.objects_checked += 1;
                    let placement = placement.for_object(&header.object_id);
                    if let Err(e) = self
                        .reconcile_object(&header, record, &placement, &mut summary)
                        .await
                    {
                        warn!(addr = %header.address(), %e, "reconciliation of object failed");
                        summary.failed += 1;
                    }
                }
                Some(Resolved::Degraded) => summary.degraded += 1,
                Some(Resolved::Skip) | None => {}
            }
        }

        if summary.replicas_created > 0 || summary.degraded > 0 || summary.failed > 0 {
            info!(
                checked = summary.objects_checked,
                created = summary.replicas_created,
                degraded = summary.degraded,
                failed = summary.failed,
                "reconciliation pass finished"
            );
        }
        Ok(summary)
    }

    /// Resolve the placement of a container for this pass.
    fn resolve_container(
        &self,
        cid: &ContainerId,
        candidates: &[NodeRecord],
    ) -> Result<Resolved, ReplicationError> {
        let Some(record) = self.meta.get_container(cid)? else {
            return Ok(Resolved::Skip);
        };
        if record.is_tombstone() {
            return Ok(Resolved::Skip);
        }

        match resolve(&record.container.placement_policy, candidates, cid) {
            Ok(placement) => Ok(Resolved::Ready(record, placement)),
            Err(e @ PlacementError::InsufficientNodes { .. }) => {
                warn!(container = %cid, %e, "placement degraded");
                Ok(Resolved::Degraded)
            }
            Err(e) => {
                error!(container = %cid, %e, "stored placement policy does not resolve");
                Ok(Resolved::Degraded)
            }
        }
    }

    async fn reconcile_object(
        &self,
        header: &ObjectHeader,
        record: &ContainerRecord,
        placement: &Placement,
        summary: &mut ReconcileSummary,
    ) -> Result<(), ReplicationError> {
        let addr = header.address();
        let local = self.cluster.local_node_id();

        let payload = {
            let _guard = self.locks.lock(&addr).await;
            match self.store.get(addr).await? {
                Some(payload) => payload,
                None => {
                    debug!(%addr, "header without local payload, skipping");
                    return Ok(());
                }
            }
        };

        if !header.verify_id() || !header.verify_payload(&payload) {
            warn!(%addr, "local replica failed integrity check, not pushing");
            summary.corrupt += 1;
            self.events.emit(ReplicaCorrupted {
                address: addr,
                node_id: local,
            });
            return Ok(());
        }

        let mut holders = vec![local];
        for target in placement.primary_targets() {
            if target == local {
                continue;
            }
            let timeout = self.config.request_timeout;
            let presence = tokio::time::timeout(timeout, self.transport.has_replica(target, addr));
            match presence.await {
                Ok(Ok(true)) => holders.push(target),
                Ok(Ok(false)) => {
                    self.throttle.acquire(payload.len() as u64).await;
                    let push = self.transport.push_replica(
                        target,
                        Some(record.clone()),
                        header.clone(),
                        payload.clone(),
                    );
                    match tokio::time::timeout(timeout, push).await {
                        Ok(Ok(_)) => {
                            info!(%addr, %target, "restored replica");
                            summary.replicas_created += 1;
                            holders.push(target);
                            self.events.emit(ReplicaRestored {
                                address: addr,
                                target,
                            });
                        }
                        Ok(Err(e)) => {
                            warn!(%addr, %target, %e, "replica push failed");
                            summary.failed += 1;
                        }
                        Err(_) => {
                            warn!(%addr, %target, "replica push timed out");
                            summary.failed += 1;
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!(%addr, %target, %e, "replica presence check failed");
                    summary.failed += 1;
                }
                Err(_) => {
                    debug!(%addr, %target, "replica presence check timed out");
                    summary.failed += 1;
                }
            }
        }

        self.meta.put_replicas(&addr, &holders)?;
        Ok(())
    }

    async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!("replicator started");
        let mut interval = tokio::time::interval(self.config.interval);
        let mut events = self.cluster.subscribe();

        loop {
            let triggered = tokio::select! {
                _ = interval.tick() => true,
                event = events.recv() => match event {
                    Ok(ClusterEvent::NodeUnreachable(node_id)) => {
                        debug!(%node_id, "node unreachable, reconciling");
                        true
                    }
                    Ok(ClusterEvent::NodeReturned(node_id)) => {
                        debug!(%node_id, "node returned, reconciling");
                        true
                    }
                    Ok(_) => false,
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => {
                    info!("replicator shutting down");
                    break;
                }
            };

            if triggered && let Err(e) = self.reconcile_once().await {
                error!(%e, "reconciliation pass failed");
            }
        }

        info!("replicator stopped");
    }
}

/// Handle to a running [`Replicator`].
pub struct ReplicatorHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReplicatorHandle {
    /// Ask the background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Run `replicator` in the background.
pub fn start(replicator: Arc<Replicator>) -> ReplicatorHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move {
        replicator.run(shutdown_rx).await;
    });
    ReplicatorHandle { shutdown_tx, task }
}
