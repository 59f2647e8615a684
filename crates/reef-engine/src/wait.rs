//! Bounded convergence waits.
//!
//! Cluster state converges asynchronously, so callers that need "every node
//! sees the container" poll for it. Every wait here gives up with
//! [`EngineError::Timeout`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reef_types::{ContainerId, Epoch, NodeId, ObjectAddress};
use tokio::time::Instant;
use tracing::debug;

use crate::error::EngineError;
use crate::node::ReefNode;

/// Default polling interval of the helpers below.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll `cond` every `interval` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut cond: F,
) -> Result<(), EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            debug!(what, ?timeout, "wait timed out");
            return Err(EngineError::Timeout(what.to_string()));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait until every node in `nodes` knows the live container `id`.
pub async fn wait_for_container_creation(
    nodes: &[Arc<ReefNode>],
    id: ContainerId,
    timeout: Duration,
) -> Result<(), EngineError> {
    wait_until(
        &format!("container {id} on every node"),
        timeout,
        POLL_INTERVAL,
        move || async move { nodes.iter().all(|n| n.get_container(&id).is_ok()) },
    )
    .await
}

/// Wait until no node in `nodes` reports `id` as live.
pub async fn wait_for_container_deletion(
    nodes: &[Arc<ReefNode>],
    id: ContainerId,
    timeout: Duration,
) -> Result<(), EngineError> {
    wait_until(
        &format!("deletion of container {id} on every node"),
        timeout,
        POLL_INTERVAL,
        move || async move {
            nodes
                .iter()
                .all(|n| matches!(n.get_container(&id), Err(EngineError::ContainerNotFound(_))))
        },
    )
    .await
}

/// Wait until every node in `nodes` has reached `epoch`.
pub async fn wait_for_epoch(
    nodes: &[Arc<ReefNode>],
    epoch: Epoch,
    timeout: Duration,
) -> Result<(), EngineError> {
    wait_until(
        &format!("epoch {epoch} on every node"),
        timeout,
        POLL_INTERVAL,
        move || async move { nodes.iter().all(|n| n.current_epoch() >= epoch) },
    )
    .await
}

/// Wait until `node` sees at least `copies` live replicas of `address`, and
/// return the holders.
pub async fn wait_object_replication(
    node: &ReefNode,
    address: ObjectAddress,
    copies: usize,
    timeout: Duration,
) -> Result<Vec<NodeId>, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(holders) = node.replica_holders(address).await
            && holders.len() >= copies
        {
            return Ok(holders);
        }
        if Instant::now() >= deadline {
            return Err(EngineError::Timeout(format!(
                "{copies} replicas of {address}"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
