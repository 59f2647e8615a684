//! Incoming protocol handler for the Reef daemon.
//!
//! Implements iroh's [`ProtocolHandler`] trait so the iroh [`Router`] can hand
//! accepted QUIC connections to the node.
//!
//! [`ProtocolHandler`]: iroh::protocol::ProtocolHandler
//! [`Router`]: iroh::protocol::Router

use std::fmt;
use std::sync::Arc;

use iroh::EndpointAddr;
use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use reef_net::{MessageHandler, ReefTransport, node_id_of};
use tracing::debug;

/// Serves connections from other Reef nodes and from `reefd` clients.
pub struct ReefProtocol {
    handler: Arc<dyn MessageHandler>,
    transport: Arc<ReefTransport>,
}

impl fmt::Debug for ReefProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReefProtocol").finish_non_exhaustive()
    }
}

impl ReefProtocol {
    /// Dispatch incoming messages to `handler`. Callers are remembered in
    /// `transport`'s address book so that replies to them can be routed.
    pub fn new(handler: Arc<dyn MessageHandler>, transport: Arc<ReefTransport>) -> Self {
        Self { handler, transport }
    }
}

impl iroh::protocol::ProtocolHandler for ReefProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let remote_id = conn.remote_id();
        let node_id = node_id_of(remote_id);
        self.transport
            .learn_peer(node_id, EndpointAddr::new(remote_id))
            .await;

        debug!(peer = %node_id, "accepted connection");
        ReefTransport::serve(conn, self.handler.clone()).await;
        Ok(())
    }
}
