//! Push-pull gossip and the join handshake.
//!
//! Every `interval`, the gossip loop picks up to `fanout` random reachable
//! peers and exchanges a [`GossipDigest`] with each: both sides merge what
//! they receive. A digest carries the epoch, every member and the version of
//! every container record. Each side answers the versions it has newer
//! records for with those records, so a missed announcement is repaired
//! within one round without shipping every container on every exchange.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use reef_net::{GossipDigest, ReefMessage, Transport, TransportExt};
use reef_types::{ContainerRecord, Epoch, NodeId, NodeRecord};
use tracing::{debug, info, warn};

use crate::ClusterError;
use crate::epoch::EpochClock;
use crate::state::ClusterState;

/// The replicated state a node gossips about.
#[async_trait::async_trait]
pub trait GossipState: Send + Sync {
    /// Snapshot the local state.
    async fn digest(&self) -> GossipDigest;

    /// Merge a digest received from `from`.
    ///
    /// Returns the local container records `from` is missing or holds in an
    /// older state, judging by the versions in `digest`.
    async fn merge(&self, from: NodeId, digest: GossipDigest) -> Vec<ContainerRecord>;
}

/// Configuration for the gossip loop.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Interval between gossip rounds.
    pub interval: Duration,
    /// Peers contacted per round.
    pub fanout: usize,
}

impl GossipConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            interval: Duration::from_millis(100),
            fanout: 3,
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            interval: Duration::from_secs(2),
            fanout: 3,
        }
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Merge the membership and epoch parts of a digest into the local view.
///
/// Unknown members are added as `Healthy` and left to the health monitor.
/// Returns the number of members that were new.
pub async fn merge_membership(
    cluster: &ClusterState,
    clock: &EpochClock,
    members: Vec<NodeRecord>,
    epoch: Epoch,
) -> Result<usize, ClusterError> {
    clock.observe(epoch)?;
    let mut added = 0;
    for member in members {
        if cluster.add_node(member).await {
            added += 1;
        }
    }
    Ok(added)
}

/// Run one gossip round against up to `fanout` random reachable peers.
pub async fn gossip_round(
    cluster: &ClusterState,
    transport: &dyn Transport,
    state: &dyn GossipState,
    fanout: usize,
) -> usize {
    let peers = cluster.reachable_peers().await;
    let targets: Vec<NodeId> = peers
        .choose_multiple(&mut rand::rng(), fanout)
        .copied()
        .collect();

    let mut exchanged = 0;
    for peer in targets {
        let digest = state.digest().await;
        match transport.sync(peer, digest).await {
            Ok(theirs) => {
                let missing = state.merge(peer, theirs).await;
                if !missing.is_empty() {
                    debug!(%peer, records = missing.len(), "sending records peer lacks");
                }
                for record in missing {
                    if let Err(e) = transport
                        .send_to(peer, &ReefMessage::ContainerAnnounce { record })
                        .await
                    {
                        debug!(%peer, %e, "failed to send container record");
                        break;
                    }
                }
                exchanged += 1;
            }
            Err(e) => debug!(%peer, %e, "gossip exchange failed"),
        }
    }
    exchanged
}

/// Join the cluster through `seeds`.
///
/// Each reachable seed admits this node and answers with its member list and
/// epoch, which are merged into the local view. Succeeds if at least one seed
/// answered; an empty seed list is a cluster of one.
pub async fn join(
    cluster: &ClusterState,
    clock: &EpochClock,
    transport: &dyn Transport,
    seeds: &[NodeId],
) -> Result<usize, ClusterError> {
    let mut answered = 0;
    let mut last_error = None;

    for seed in seeds.iter().filter(|s| **s != cluster.local_node_id()) {
        match transport.join(*seed, cluster.local_record().clone()).await {
            Ok((members, epoch)) => {
                let added = merge_membership(cluster, clock, members, epoch).await?;
                info!(%seed, added, epoch, "joined via seed");
                answered += 1;
            }
            Err(e) => {
                warn!(%seed, %e, "seed did not answer join");
                last_error = Some(e.to_string());
            }
        }
    }

    match last_error {
        Some(e) if answered == 0 => Err(ClusterError::JoinFailed(e)),
        _ => Ok(answered),
    }
}

/// Handle to a running gossip loop.
pub struct GossipHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl GossipHandle {
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

/// Start the gossip loop and return a handle.
pub fn start(
    config: GossipConfig,
    cluster: Arc<ClusterState>,
    transport: Arc<dyn Transport>,
    state: Arc<dyn GossipState>,
) -> GossipHandle {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn(async move {
        info!("gossip started");
        let mut interval = tokio::time::interval(config.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    gossip_round(&cluster, transport.as_ref(), state.as_ref(), config.fanout).await;
                }
                _ = shutdown_rx.changed() => {
                    info!("gossip shutting down");
                    break;
                }
            }
        }
        info!("gossip stopped");
    });

    GossipHandle { shutdown_tx, task }
}
