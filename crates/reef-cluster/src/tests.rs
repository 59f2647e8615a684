//! Tests for the reef-cluster crate.

use std::sync::Arc;
use std::time::Duration;

use reef_meta::MetaStore;
use reef_net::{GossipDigest, MessageHandler, ReefMessage, SimNetwork};
use reef_types::{
    BasicAcl, ClusterEvent, Container, ContainerRecord, NodeId, NodeRecord, NodeState, OwnerId,
    PlacementRule, Replica,
};
use tokio::sync::Mutex;

use crate::gossip::{self, GossipState};
use crate::health::{self, HealthMonitor};
use crate::{ClusterError, ClusterState, EpochClock, HealthConfig};

// -----------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------

fn record(n: u8) -> NodeRecord {
    NodeRecord::new(NodeId::from([n; 32]), format!("sim://{n}"))
}

/// A peer that answers pings with its epoch and join requests with its view.
struct TestPeer {
    record: NodeRecord,
    epoch: u64,
    members: Vec<NodeRecord>,
    digests_seen: Mutex<Vec<GossipDigest>>,
    announced: Mutex<Vec<ContainerRecord>>,
}

impl TestPeer {
    fn new(n: u8, epoch: u64) -> Arc<Self> {
        Arc::new(Self {
            record: record(n),
            epoch,
            members: Vec::new(),
            digests_seen: Mutex::new(Vec::new()),
            announced: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl MessageHandler for TestPeer {
    async fn handle(&self, _from: NodeId, msg: ReefMessage) -> Option<ReefMessage> {
        match msg {
            ReefMessage::Ping { .. } => Some(ReefMessage::Pong { epoch: self.epoch }),
            ReefMessage::Join { .. } => {
                let mut members = self.members.clone();
                members.push(self.record.clone());
                Some(ReefMessage::JoinAck {
                    members,
                    epoch: self.epoch,
                })
            }
            ReefMessage::SyncRequest { digest } => {
                self.digests_seen.lock().await.push(digest);
                Some(ReefMessage::SyncResponse {
                    digest: GossipDigest {
                        epoch: self.epoch,
                        members: vec![self.record.clone()],
                        ..Default::default()
                    },
                })
            }
            ReefMessage::ContainerAnnounce { record } => {
                self.announced.lock().await.push(record);
                None
            }
            _ => None,
        }
    }
}

fn attach(net: &SimNetwork, peer: &Arc<TestPeer>) {
    let handler: Arc<dyn MessageHandler> = peer.clone();
    net.register(peer.record.node_id, Arc::downgrade(&handler));
}

/// Poll `cond` until it holds or the deadline passes.
async fn eventually<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// -----------------------------------------------------------------------
// ClusterState
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_add_node_emits_joined_once() {
    let state = ClusterState::new(record(1));
    let mut rx = state.subscribe();

    assert!(state.add_node(record(2)).await);
    assert!(!state.add_node(record(2)).await);
    assert!(!state.add_node(record(1)).await, "local node is never a peer");

    assert!(matches!(rx.try_recv(), Ok(ClusterEvent::NodeJoined(r)) if r.node_id == record(2).node_id));
    assert!(rx.try_recv().is_err());
    assert_eq!(state.node_count().await, 2);
}

#[tokio::test]
async fn test_add_node_keeps_local_health_verdict() {
    let state = ClusterState::new(record(1));
    state.add_node(record(2)).await;
    state
        .set_state(&record(2).node_id, NodeState::Unreachable)
        .await;

    // Gossip re-announcing the node as healthy must not override probing.
    let mut fresh = record(2).with_attribute("City", "Oslo");
    fresh.state = NodeState::Healthy;
    state.add_node(fresh).await;

    let known = state.get_node(&record(2).node_id).await.unwrap();
    assert_eq!(known.state, NodeState::Unreachable);
    assert_eq!(known.attributes["City"], "Oslo");
}

#[tokio::test]
async fn test_set_state_events() {
    let state = ClusterState::new(record(1));
    let id = record(2).node_id;
    state.add_node(record(2)).await;
    let mut rx = state.subscribe();

    state.set_state(&id, NodeState::Suspect).await;
    state.set_state(&id, NodeState::Unreachable).await;
    state.set_state(&id, NodeState::Healthy).await;

    assert_eq!(rx.try_recv().unwrap(), ClusterEvent::NodeUnreachable(id));
    assert_eq!(rx.try_recv().unwrap(), ClusterEvent::NodeReturned(id));
    assert!(rx.try_recv().is_err());

    assert!(state.set_state(&record(9).node_id, NodeState::Healthy).await.is_none());
}

#[tokio::test]
async fn test_candidates_include_local_node() {
    let state = ClusterState::new(record(1));
    state.add_node(record(2)).await;
    state.add_node(record(3)).await;
    state
        .set_state(&record(3).node_id, NodeState::Unreachable)
        .await;

    assert_eq!(state.candidates().await.len(), 3);
    assert_eq!(state.reachable_peers().await, vec![record(2).node_id]);
    assert!(state.is_reachable(&record(1).node_id).await);
    assert!(!state.is_reachable(&record(3).node_id).await);
}

// -----------------------------------------------------------------------
// EpochClock
// -----------------------------------------------------------------------

#[test]
fn test_epoch_tick_and_observe() {
    let clock = EpochClock::new(0);
    let rx = clock.subscribe();

    assert_eq!(clock.tick().unwrap(), 1);
    assert_eq!(*rx.borrow(), 1);

    assert!(!clock.observe(1).unwrap());
    assert!(!clock.observe(0).unwrap(), "never goes backwards");
    assert!(clock.observe(5).unwrap());
    assert_eq!(clock.current(), 5);
    assert_eq!(clock.tick().unwrap(), 6);
}

#[test]
fn test_epoch_tick_at_max_fails() {
    let clock = EpochClock::new(0);
    assert!(clock.observe(u64::MAX).unwrap());
    let rx = clock.subscribe();

    assert!(matches!(clock.tick(), Err(ClusterError::EpochOverflow(u64::MAX))));
    assert_eq!(clock.current(), u64::MAX);
    assert!(!rx.has_changed().unwrap());
}

#[test]
fn test_epoch_persists_across_restore() {
    let meta = Arc::new(MetaStore::open_temporary().unwrap());
    {
        let clock = EpochClock::restore(meta.clone()).unwrap();
        assert_eq!(clock.current(), 0);
        clock.tick().unwrap();
        clock.observe(4).unwrap();
    }
    let clock = EpochClock::restore(meta).unwrap();
    assert_eq!(clock.current(), 4);
}

// -----------------------------------------------------------------------
// Health monitor
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_probe_adopts_peer_epoch() {
    let net = SimNetwork::new();
    let peer = TestPeer::new(2, 7);
    attach(&net, &peer);

    let state = ClusterState::new(record(1));
    state.add_node(record(2)).await;
    let clock = Arc::new(EpochClock::new(3));
    let monitor = HealthMonitor::new(
        HealthConfig::test_config(),
        state.clone(),
        clock.clone(),
        net.transport(record(1).node_id),
        None,
    );

    monitor.probe_round().await;
    assert_eq!(clock.current(), 7);
    assert_eq!(
        state.get_node(&record(2).node_id).await.unwrap().state,
        NodeState::Healthy
    );
}

#[tokio::test]
async fn test_probe_rounds_walk_state_machine() {
    let net = SimNetwork::new();
    let peer = TestPeer::new(2, 0);
    attach(&net, &peer);
    let peer_id = peer.record.node_id;

    let meta = Arc::new(MetaStore::open_temporary().unwrap());
    let state = ClusterState::new(record(1));
    state.add_node(peer.record.clone()).await;
    let config = HealthConfig {
        unreachable_timeout: Duration::from_secs(60),
        ..HealthConfig::test_config()
    };
    let monitor = HealthMonitor::new(
        config.clone(),
        state.clone(),
        Arc::new(EpochClock::new(0)),
        net.transport(record(1).node_id),
        Some(meta.clone()),
    );

    net.block(peer_id);
    monitor.probe_round().await;
    assert_eq!(state.get_node(&peer_id).await.unwrap().state, NodeState::Suspect);
    for _ in 1..config.max_failures {
        monitor.probe_round().await;
    }
    assert_eq!(
        state.get_node(&peer_id).await.unwrap().state,
        NodeState::Unreachable
    );
    assert_eq!(
        meta.get_member(&peer_id).unwrap().unwrap().state,
        NodeState::Unreachable
    );

    net.unblock(peer_id);
    for _ in 1..config.recovery_successes {
        monitor.probe_round().await;
    }
    assert_eq!(
        state.get_node(&peer_id).await.unwrap().state,
        NodeState::Unreachable,
        "recovery waits for the settle count"
    );
    monitor.probe_round().await;
    assert_eq!(state.get_node(&peer_id).await.unwrap().state, NodeState::Healthy);
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_health_task_detects_partition() {
    let net = SimNetwork::new();
    let peer = TestPeer::new(2, 0);
    attach(&net, &peer);
    let peer_id = peer.record.node_id;

    let state = ClusterState::new(record(1));
    state.add_node(peer.record.clone()).await;
    let mut events = state.subscribe();
    let handle = health::start(
        HealthConfig::test_config(),
        state.clone(),
        Arc::new(EpochClock::new(0)),
        net.transport(record(1).node_id),
        None,
    );

    net.block(peer_id);
    loop {
        if let Ok(ClusterEvent::NodeUnreachable(id)) = events.recv().await {
            assert_eq!(id, peer_id);
            break;
        }
    }

    net.unblock(peer_id);
    loop {
        if let Ok(ClusterEvent::NodeReturned(id)) = events.recv().await {
            assert_eq!(id, peer_id);
            break;
        }
    }

    handle.shutdown();
    assert!(eventually(Duration::from_secs(2), || async { !handle.is_running() }).await);
}

// -----------------------------------------------------------------------
// Gossip and join
// -----------------------------------------------------------------------

#[tokio::test]
async fn test_join_merges_seed_view() {
    let net = SimNetwork::new();
    let mut seed = TestPeer::new(2, 11);
    Arc::get_mut(&mut seed).unwrap().members = vec![record(3), record(4)];
    attach(&net, &seed);

    let state = ClusterState::new(record(1));
    let clock = EpochClock::new(0);
    let transport = net.transport(record(1).node_id);

    let answered = gossip::join(&state, &clock, transport.as_ref(), &[seed.record.node_id])
        .await
        .unwrap();
    assert_eq!(answered, 1);
    assert_eq!(state.node_count().await, 4);
    assert_eq!(clock.current(), 11);
}

#[tokio::test]
async fn test_join_fails_when_no_seed_answers() {
    let net = SimNetwork::new();
    let state = ClusterState::new(record(1));
    let clock = EpochClock::new(0);
    let transport = net.transport(record(1).node_id);

    assert!(gossip::join(&state, &clock, transport.as_ref(), &[record(9).node_id])
        .await
        .is_err());
    assert_eq!(
        gossip::join(&state, &clock, transport.as_ref(), &[]).await.unwrap(),
        0
    );
}

/// Gossip state that tracks membership and epoch, and claims every peer
/// lacks `records`.
struct MembershipOnly {
    cluster: Arc<ClusterState>,
    clock: EpochClock,
    records: Vec<ContainerRecord>,
}

#[async_trait::async_trait]
impl GossipState for MembershipOnly {
    async fn digest(&self) -> GossipDigest {
        GossipDigest {
            epoch: self.clock.current(),
            containers: self.records.iter().map(Into::into).collect(),
            records: vec![],
            members: self.cluster.candidates().await,
        }
    }

    async fn merge(&self, _from: NodeId, digest: GossipDigest) -> Vec<ContainerRecord> {
        gossip::merge_membership(&self.cluster, &self.clock, digest.members, digest.epoch)
            .await
            .unwrap();
        self.records.clone()
    }
}

#[tokio::test]
async fn test_gossip_round_exchanges_digests() {
    let net = SimNetwork::new();
    let peer = TestPeer::new(2, 6);
    attach(&net, &peer);

    let cluster = ClusterState::new(record(1));
    cluster.add_node(peer.record.clone()).await;
    let state = MembershipOnly {
        cluster: cluster.clone(),
        clock: EpochClock::new(2),
        records: vec![],
    };
    let transport = net.transport(record(1).node_id);

    let exchanged = gossip::gossip_round(&cluster, transport.as_ref(), &state, 3).await;
    assert_eq!(exchanged, 1);
    assert_eq!(state.clock.current(), 6);

    let seen = peer.digests_seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].epoch, 2);
    assert_eq!(seen[0].members.len(), 2);
}

#[tokio::test]
#[ntest::timeout(5000)]
async fn test_gossip_round_sends_records_peer_lacks() {
    let net = SimNetwork::new();
    let peer = TestPeer::new(2, 1);
    attach(&net, &peer);

    let rule = PlacementRule {
        replicas: vec![Replica {
            count: 1,
            selector: None,
        }],
        backup_factor: None,
        selectors: vec![],
        filters: vec![],
    };
    let container = Container::new(
        OwnerId::from_data(b"alice"),
        rule,
        BasicAcl::Private,
        None,
        1,
        [7; 16],
    );
    let lacking = ContainerRecord::live(container);

    let cluster = ClusterState::new(record(1));
    cluster.add_node(peer.record.clone()).await;
    let state = MembershipOnly {
        cluster: cluster.clone(),
        clock: EpochClock::new(1),
        records: vec![lacking.clone()],
    };
    let transport = net.transport(record(1).node_id);

    assert_eq!(gossip::gossip_round(&cluster, transport.as_ref(), &state, 3).await, 1);

    // The digest itself only carries versions.
    {
        let seen = peer.digests_seen.lock().await;
        assert_eq!(seen[0].containers.len(), 1);
        assert_eq!(seen[0].containers[0].id, lacking.id());
        assert!(seen[0].records.is_empty());
    }

    let announced = &peer.announced;
    let expected = vec![lacking.clone()];
    assert!(
        eventually(Duration::from_secs(2), || async {
            *announced.lock().await == expected
        })
        .await
    );
}
