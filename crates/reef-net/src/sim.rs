//! In-process network for multi-node tests.
//!
//! Every node registers its [`MessageHandler`] with a shared [`SimNetwork`]
//! and talks through a [`SimTransport`]. Messages still go through the
//! postcard codec, so anything that would not survive the wire fails here
//! too. A blocked node neither sends nor receives, which is how tests cut a
//! node off without it knowing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use reef_types::NodeId;
use tracing::trace;

use crate::{MessageHandler, NetError, ReefMessage, Transport};

#[derive(Default)]
struct SimInner {
    handlers: HashMap<NodeId, Weak<dyn MessageHandler>>,
    blocked: HashSet<NodeId>,
}

/// Shared registry of simulated nodes. Cheap to clone.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<RwLock<SimInner>>,
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's handler. Held weakly: dropping the node detaches it.
    pub fn register(&self, node_id: NodeId, handler: Weak<dyn MessageHandler>) {
        self.inner
            .write()
            .expect("sim network lock poisoned")
            .handlers
            .insert(node_id, handler);
    }

    /// Detach a node.
    pub fn unregister(&self, node_id: &NodeId) {
        self.inner
            .write()
            .expect("sim network lock poisoned")
            .handlers
            .remove(node_id);
    }

    /// A transport sending on behalf of `from`.
    pub fn transport(&self, from: NodeId) -> Arc<SimTransport> {
        Arc::new(SimTransport {
            network: self.clone(),
            from,
        })
    }

    /// Drop all traffic to and from `node_id`.
    pub fn block(&self, node_id: NodeId) {
        self.inner
            .write()
            .expect("sim network lock poisoned")
            .blocked
            .insert(node_id);
    }

    /// Restore traffic to and from `node_id`.
    pub fn unblock(&self, node_id: NodeId) {
        self.inner
            .write()
            .expect("sim network lock poisoned")
            .blocked
            .remove(&node_id);
    }

    /// Whether `node_id` is currently cut off.
    pub fn is_blocked(&self, node_id: &NodeId) -> bool {
        self.inner
            .read()
            .expect("sim network lock poisoned")
            .blocked
            .contains(node_id)
    }

    /// Find the handler for a message from `from` to `to`, or fail as the
    /// real network would.
    fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn MessageHandler>, NetError> {
        let inner = self.inner.read().expect("sim network lock poisoned");
        if inner.blocked.contains(&from) || inner.blocked.contains(&to) {
            return Err(NetError::Unreachable(to));
        }
        inner
            .handlers
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or(NetError::UnknownPeer(to))
    }

    async fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        msg: &ReefMessage,
    ) -> Result<Option<ReefMessage>, NetError> {
        let handler = self.route(from, to)?;
        let decoded = ReefMessage::from_bytes(&msg.to_bytes()?)?;
        trace!(%from, %to, kind = decoded.kind(), "sim deliver");
        let reply = handler.handle(from, decoded).await;

        // A partition raised while the request was in flight eats the reply.
        if self.is_blocked(&from) || self.is_blocked(&to) {
            return Err(NetError::Unreachable(to));
        }
        match reply {
            Some(reply) => Ok(Some(ReefMessage::from_bytes(&reply.to_bytes()?)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("sim network lock poisoned");
        f.debug_struct("SimNetwork")
            .field("nodes", &inner.handlers.len())
            .field("blocked", &inner.blocked.len())
            .finish()
    }
}

/// [`Transport`] for one node of a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    network: SimNetwork,
    from: NodeId,
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn request(&self, to: NodeId, msg: &ReefMessage) -> Result<ReefMessage, NetError> {
        self.network
            .deliver(self.from, to, msg)
            .await?
            .ok_or(NetError::NoResponse)
    }

    async fn send_to(&self, to: NodeId, msg: &ReefMessage) -> Result<(), NetError> {
        let handler = self.network.route(self.from, to)?;
        let decoded = ReefMessage::from_bytes(&msg.to_bytes()?)?;
        let from = self.from;
        // One-way delivery does not wait for the receiver.
        tokio::spawn(async move {
            let _ = handler.handle(from, decoded).await;
        });
        Ok(())
    }
}
