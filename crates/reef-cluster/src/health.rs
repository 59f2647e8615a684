//! Node health monitoring over ping/pong.
//!
//! The monitor periodically probes every known peer, unreachable ones
//! included so that recovery is noticed, and moves each peer through
//!
//! ```text
//! Healthy ──fail──▶ Suspect ──max_failures / unreachable_timeout──▶ Unreachable
//!    ▲                 │                                                │
//!    └────one success──┘◀─────────── recovery_successes in a row ───────┘
//! ```
//!
//! Every pong carries the peer's epoch, which is fed to the [`EpochClock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reef_meta::MetaStore;
use reef_net::{Transport, TransportExt};
use reef_types::{NodeId, NodeState};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::epoch::EpochClock;
use crate::state::ClusterState;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe rounds.
    pub probe_interval: Duration,
    /// Deadline for a single probe.
    pub probe_timeout: Duration,
    /// Consecutive failures before a peer is declared unreachable.
    pub max_failures: u32,
    /// Time since the last success before a peer is declared unreachable.
    pub unreachable_timeout: Duration,
    /// Consecutive successes before an unreachable peer is healthy again.
    pub recovery_successes: u32,
}

impl HealthConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            max_failures: 3,
            unreachable_timeout: Duration::from_millis(500),
            recovery_successes: 2,
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            max_failures: 3,
            unreachable_timeout: Duration::from_secs(15),
            recovery_successes: 3,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Probe bookkeeping for one peer.
#[derive(Debug, Clone)]
struct ProbeStats {
    last_success: Instant,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl ProbeStats {
    fn new() -> Self {
        Self {
            last_success: Instant::now(),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Decide the next state of a peer after one probe.
fn next_state(
    config: &HealthConfig,
    current: NodeState,
    stats: &ProbeStats,
    success: bool,
    now: Instant,
) -> NodeState {
    match (current, success) {
        (NodeState::Healthy | NodeState::Suspect, true) => NodeState::Healthy,
        (NodeState::Unreachable, true) => {
            if stats.consecutive_successes >= config.recovery_successes {
                NodeState::Healthy
            } else {
                NodeState::Unreachable
            }
        }
        (NodeState::Unreachable, false) => NodeState::Unreachable,
        (NodeState::Healthy | NodeState::Suspect, false) => {
            if stats.consecutive_failures >= config.max_failures
                || now.duration_since(stats.last_success) >= config.unreachable_timeout
            {
                NodeState::Unreachable
            } else {
                NodeState::Suspect
            }
        }
    }
}

/// Periodically probes peers and updates the cluster view.
pub struct HealthMonitor {
    config: HealthConfig,
    cluster: Arc<ClusterState>,
    clock: Arc<EpochClock>,
    transport: Arc<dyn Transport>,
    meta: Option<Arc<MetaStore>>,
    stats: Mutex<HashMap<NodeId, ProbeStats>>,
}

impl HealthMonitor {
    /// Create a monitor. Use [`start`] to run it in the background.
    pub fn new(
        config: HealthConfig,
        cluster: Arc<ClusterState>,
        clock: Arc<EpochClock>,
        transport: Arc<dyn Transport>,
        meta: Option<Arc<MetaStore>>,
    ) -> Self {
        Self {
            config,
            cluster,
            clock,
            transport,
            meta,
            stats: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!("health monitor started");
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_round().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }

        info!("health monitor stopped");
    }

    /// Probe every known peer once, concurrently, and apply the outcomes.
    pub async fn probe_round(&self) {
        let peers = self.cluster.peers().await;
        let epoch = self.clock.current();

        let mut probes = JoinSet::new();
        for peer in peers {
            let transport = self.transport.clone();
            let timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let outcome = tokio::time::timeout(timeout, transport.ping(peer.node_id, epoch)).await;
                (peer.node_id, outcome)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((node_id, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(Ok(remote_epoch)) => {
                    if let Err(e) = self.clock.observe(remote_epoch) {
                        warn!(%e, "failed to adopt peer epoch");
                    }
                    self.record(node_id, true).await;
                }
                Ok(Err(e)) => {
                    debug!(%node_id, %e, "probe failed");
                    self.record(node_id, false).await;
                }
                Err(_) => {
                    debug!(%node_id, "probe timed out");
                    self.record(node_id, false).await;
                }
            }
        }
    }

    /// Record one probe outcome and apply any resulting transition.
    async fn record(&self, node_id: NodeId, success: bool) {
        let Some(record) = self.cluster.get_node(&node_id).await else {
            return;
        };

        let now = Instant::now();
        let next = {
            let mut all = self.stats.lock().await;
            let stats = all.entry(node_id).or_insert_with(ProbeStats::new);
            if success {
                stats.last_success = now;
                stats.consecutive_failures = 0;
                stats.consecutive_successes += 1;
            } else {
                stats.consecutive_failures += 1;
                stats.consecutive_successes = 0;
            }
            next_state(&self.config, record.state, stats, success, now)
        };

        if next == record.state {
            return;
        }
        if next == NodeState::Unreachable {
            warn!(%node_id, "peer declared unreachable");
        }
        self.cluster.set_state(&node_id, next).await;

        if let Some(meta) = &self.meta
            && let Some(updated) = self.cluster.get_node(&node_id).await
            && let Err(e) = meta.put_member(&updated)
        {
            error!(%e, "failed to persist member state");
        }
    }
}

/// Handle to a running [`HealthMonitor`].
pub struct HealthHandle {
    monitor: Arc<HealthMonitor>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl HealthHandle {
    /// The running monitor, e.g. to force a probe round.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

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

/// Start the health monitor and return a handle.
pub fn start(
    config: HealthConfig,
    cluster: Arc<ClusterState>,
    clock: Arc<EpochClock>,
    transport: Arc<dyn Transport>,
    meta: Option<Arc<MetaStore>>,
) -> HealthHandle {
    spawn(Arc::new(HealthMonitor::new(
        config, cluster, clock, transport, meta,
    )))
}

/// Run an existing monitor in the background.
pub fn spawn(monitor: Arc<HealthMonitor>) -> HealthHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = monitor.clone();
    let task = tokio::spawn(async move {
        runner.run(shutdown_rx).await;
    });

    HealthHandle {
        monitor,
        shutdown_tx,
        task,
    }
}
