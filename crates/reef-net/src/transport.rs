//! Network transport built on iroh QUIC.
//!
//! [`ReefTransport`] wraps an iroh [`Endpoint`] and provides:
//! - an address book mapping [`NodeId`]s to iroh addresses,
//! - connection pooling (reuse connections to the same peer, dial each peer
//!   under its own lock and within a time limit),
//! - request/response on bi-directional streams and one-way delivery on
//!   uni-directional streams, both length-prefixed postcard frames,
//! - [`ReefTransport::serve`] to feed incoming streams to a [`MessageHandler`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use reef_types::NodeId;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::message::{MAX_MESSAGE_SIZE, ReefMessage};
use crate::pool::{ConnectionPool, DEFAULT_CONNECT_TIMEOUT};
use crate::{MessageHandler, REEF_ALPN, Transport};

/// Network transport for inter-node communication.
pub struct ReefTransport {
    endpoint: Endpoint,
    /// Known addresses of peers.
    address_book: RwLock<HashMap<NodeId, EndpointAddr>>,
    /// Cached connections to remote peers, keyed by their iroh endpoint ID.
    connections: ConnectionPool<EndpointId, Connection>,
    /// ALPN used for outgoing connections.
    alpn: Vec<u8>,
}

impl ReefTransport {
    /// Bind a new endpoint with the default ALPN (`reef/0`).
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests that don't need relay servers.
    pub async fn bind(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
    ) -> Result<Self, NetError> {
        Self::bind_with_alpn(secret_key, relay_mode, REEF_ALPN.to_vec()).await
    }

    /// Bind a new endpoint with a cluster-specific ALPN.
    ///
    /// Use [`crate::cluster_alpn`] to derive the ALPN from a shared secret.
    pub async fn bind_with_alpn(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
        alpn: Vec<u8>,
    ) -> Result<Self, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        Ok(Self::from_endpoint_with_alpn(endpoint, alpn))
    }

    /// Wrap an existing endpoint, e.g. one shared with an iroh [`Router`].
    ///
    /// [`Router`]: iroh::protocol::Router
    pub fn from_endpoint_with_alpn(endpoint: Endpoint, alpn: Vec<u8>) -> Self {
        Self {
            endpoint,
            address_book: RwLock::new(HashMap::new()),
            connections: ConnectionPool::new(DEFAULT_CONNECT_TIMEOUT),
            alpn,
        }
    }

    /// Limit how long establishing a connection may take.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connections = ConnectionPool::new(timeout);
        self
    }

    /// Return a reference to the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Return the [`EndpointAddr`] of this transport (ID + addresses).
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// This node's id, derived from the endpoint's public key.
    pub fn node_id(&self) -> NodeId {
        node_id_of(self.endpoint.id())
    }

    /// Remember how to reach `node_id`.
    pub async fn add_peer(&self, node_id: NodeId, addr: EndpointAddr) {
        self.address_book.write().await.insert(node_id, addr);
    }

    /// Remember a peer only if no address is known yet.
    pub async fn learn_peer(&self, node_id: NodeId, addr: EndpointAddr) {
        self.address_book
            .write()
            .await
            .entry(node_id)
            .or_insert(addr);
    }

    async fn resolve(&self, node_id: NodeId) -> Result<EndpointAddr, NetError> {
        if let Some(addr) = self.address_book.read().await.get(&node_id) {
            return Ok(addr.clone());
        }
        // Fall back to discovery by public key.
        let endpoint_id = EndpointId::from_bytes(node_id.as_bytes())
            .map_err(|_| NetError::UnknownPeer(node_id))?;
        Ok(EndpointAddr::new(endpoint_id))
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Get or establish a QUIC connection to a remote peer.
    ///
    /// A dial that hangs only holds up callers of the same peer.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;
        self.connections
            .get(
                remote_id,
                |conn: &Connection| conn.close_reason().is_none(),
                || async {
                    self.endpoint
                        .connect(addr, &self.alpn)
                        .await
                        .map_err(|e| NetError::Connect(e.to_string()))
                },
            )
            .await
    }

    /// Drop the cached connection to `node_id`, if any.
    pub async fn remove_connection(&self, node_id: &NodeId) {
        if let Ok(id) = EndpointId::from_bytes(node_id.as_bytes()) {
            self.connections.remove(&id).await;
        }
    }

    // -------------------------------------------------------------------
    // Framing
    // -------------------------------------------------------------------

    /// Write one length-prefixed frame and finish the stream.
    pub async fn send_on_stream(
        send: &mut SendStream,
        message: &ReefMessage,
    ) -> Result<(), NetError> {
        let payload = message.to_bytes()?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetError::TooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        // MAX_MESSAGE_SIZE fits in the 4-byte prefix.
        let len = payload.len() as u32;
        send.write_all(&len.to_be_bytes()).await?;
        send.write_all(&payload).await?;
        send.finish()?;
        Ok(())
    }

    /// Read one length-prefixed frame.
    pub async fn recv_message(recv: &mut RecvStream) -> Result<ReefMessage, NetError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::TooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let payload = recv.read_to_end(len).await?;
        ReefMessage::from_bytes(&payload)
    }

    // -------------------------------------------------------------------
    // Incoming
    // -------------------------------------------------------------------

    /// Serve every stream of an accepted connection with `handler`.
    ///
    /// Uni-directional streams carry announcements; bi-directional streams
    /// carry requests whose answer goes back on the same stream. Returns when
    /// the connection closes.
    pub async fn serve(conn: Connection, handler: Arc<dyn MessageHandler>) {
        let from = node_id_of(conn.remote_id());

        let uni_conn = conn.clone();
        let uni_handler = handler.clone();
        let uni = tokio::spawn(async move {
            loop {
                match uni_conn.accept_uni().await {
                    Ok(mut recv) => match Self::recv_message(&mut recv).await {
                        Ok(msg) => {
                            if let Some(reply) = uni_handler.handle(from, msg).await {
                                debug!(kind = reply.kind(), "dropping reply to one-way message");
                            }
                        }
                        Err(e) => warn!(%from, "failed to decode message: {e}"),
                    },
                    Err(e) => {
                        debug!(%from, "connection closed: {e}");
                        break;
                    }
                }
            }
        });

        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let request = match Self::recv_message(&mut recv).await {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(%from, "failed to decode request: {e}");
                                return;
                            }
                        };
                        if let Some(response) = handler.handle(from, request).await
                            && let Err(e) = Self::send_on_stream(&mut send, &response).await
                        {
                            warn!(%from, "failed to send response: {e}");
                        }
                    });
                }
                Err(e) => {
                    debug!(%from, "connection closed (bi): {e}");
                    break;
                }
            }
        }

        uni.abort();
    }

    /// Gracefully close the transport.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

#[async_trait::async_trait]
impl Transport for ReefTransport {
    async fn request(&self, to: NodeId, msg: &ReefMessage) -> Result<ReefMessage, NetError> {
        let addr = self.resolve(to).await?;
        let conn = self.get_connection(addr).await?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        Self::send_on_stream(&mut send, msg).await?;
        match Self::recv_message(&mut recv).await {
            Ok(response) => Ok(response),
            Err(e) => {
                // The pooled connection may be dead; redial next time.
                self.remove_connection(&to).await;
                Err(e)
            }
        }
    }

    async fn send_to(&self, to: NodeId, msg: &ReefMessage) -> Result<(), NetError> {
        let addr = self.resolve(to).await?;
        let conn = self.get_connection(addr).await?;

        let mut send = conn
            .open_uni()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;
        Self::send_on_stream(&mut send, msg).await
    }
}

/// Map an iroh endpoint id to a [`NodeId`]: the same 32 public-key bytes.
pub fn node_id_of(id: EndpointId) -> NodeId {
    NodeId::from(*id.as_bytes())
}
