//! Network protocol for Reef.
//!
//! - [`ReefMessage`] is the wire protocol (postcard, length-prefixed frames).
//! - [`Transport`] abstracts request/response and one-way delivery by
//!   [`NodeId`]; [`MessageHandler`] is the receiving side.
//! - [`ReefTransport`] implements both over iroh QUIC with connection pooling.
//! - [`SimNetwork`] wires nodes together in-process for tests, with
//!   per-node partition injection.

mod error;
mod message;
mod pool;
mod sim;
mod transport;

use bytes::Bytes;
use reef_types::{ContainerRecord, Epoch, NodeId, NodeRecord, ObjectAddress, ObjectHeader};

pub use error::NetError;
pub use message::{
    ClientRequest, ClientResponse, ContainerVersion, GossipDigest, MAX_MESSAGE_SIZE,
    MAX_PAYLOAD_SIZE, ReefMessage,
};
pub use pool::DEFAULT_CONNECT_TIMEOUT;
pub use sim::{SimNetwork, SimTransport};
pub use transport::{ReefTransport, node_id_of};

/// Outgoing side of the network.
///
/// Implemented by [`ReefTransport`] over QUIC and by [`SimTransport`] in
/// tests, so the engine never depends on real endpoints.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `msg` to `to` and wait for its answer.
    async fn request(&self, to: NodeId, msg: &ReefMessage) -> Result<ReefMessage, NetError>;

    /// Deliver `msg` to `to` without waiting for an answer.
    async fn send_to(&self, to: NodeId, msg: &ReefMessage) -> Result<(), NetError>;
}

/// Incoming side of the network.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a message from `from`, returning the answer for requests.
    async fn handle(&self, from: NodeId, msg: ReefMessage) -> Option<ReefMessage>;
}

/// Typed request helpers over any [`Transport`].
#[async_trait::async_trait]
pub trait TransportExt: Transport {
    /// Probe `to`, returning its epoch.
    async fn ping(&self, to: NodeId, epoch: Epoch) -> Result<Epoch, NetError> {
        match self.request(to, &ReefMessage::Ping { epoch }).await? {
            ReefMessage::Pong { epoch } => Ok(epoch),
            other => Err(unexpected("pong", &other)),
        }
    }

    /// Ask a seed to admit `record`, returning its members and epoch.
    async fn join(
        &self,
        to: NodeId,
        record: NodeRecord,
    ) -> Result<(Vec<NodeRecord>, Epoch), NetError> {
        match self.request(to, &ReefMessage::Join { record }).await? {
            ReefMessage::JoinAck { members, epoch } => Ok((members, epoch)),
            other => Err(unexpected("join_ack", &other)),
        }
    }

    /// Exchange gossip digests with `to`.
    async fn sync(&self, to: NodeId, digest: GossipDigest) -> Result<GossipDigest, NetError> {
        match self.request(to, &ReefMessage::SyncRequest { digest }).await? {
            ReefMessage::SyncResponse { digest } => Ok(digest),
            other => Err(unexpected("sync_response", &other)),
        }
    }

    /// Push a replica to `to` and wait until it is stored.
    ///
    /// Returns whether `to` did not hold the replica before.
    async fn push_replica(
        &self,
        to: NodeId,
        container: Option<ContainerRecord>,
        header: ObjectHeader,
        payload: Bytes,
    ) -> Result<bool, NetError> {
        let object_id = header.object_id;
        let msg = ReefMessage::PutReplica {
            container,
            header,
            payload: payload.to_vec(),
        };
        match self.request(to, &msg).await? {
            ReefMessage::ReplicaAck {
                ok: true, created, ..
            } => Ok(created),
            ReefMessage::ReplicaAck { reason, .. } => Err(NetError::Rejected(
                reason.unwrap_or_else(|| format!("replica {object_id} refused")),
            )),
            other => Err(unexpected("replica_ack", &other)),
        }
    }

    /// Fetch a replica from `to`. `None` if it holds no copy.
    ///
    /// Integrity is left to the caller: it decides what a mismatch means.
    async fn pull_replica(
        &self,
        to: NodeId,
        address: ObjectAddress,
    ) -> Result<Option<(ObjectHeader, Bytes)>, NetError> {
        match self.request(to, &ReefMessage::GetReplica { address }).await? {
            ReefMessage::ReplicaResponse { replica } => {
                Ok(replica.map(|(header, payload)| (header, Bytes::from(payload))))
            }
            other => Err(unexpected("replica_response", &other)),
        }
    }

    /// Ask `to` to remove its replica of `address`.
    async fn drop_replica(&self, to: NodeId, address: ObjectAddress) -> Result<bool, NetError> {
        match self.request(to, &ReefMessage::DropReplica { address }).await? {
            ReefMessage::ReplicaDropped { removed } => Ok(removed),
            other => Err(unexpected("replica_dropped", &other)),
        }
    }

    /// Ask `to` whether it holds a replica of `address`.
    async fn has_replica(&self, to: NodeId, address: ObjectAddress) -> Result<bool, NetError> {
        match self.request(to, &ReefMessage::HasReplica { address }).await? {
            ReefMessage::ReplicaPresence { present } => Ok(present),
            other => Err(unexpected("replica_presence", &other)),
        }
    }

    /// Send a client request to `to`.
    async fn client(&self, to: NodeId, req: ClientRequest) -> Result<ClientResponse, NetError> {
        match self.request(to, &ReefMessage::Client(req)).await? {
            ReefMessage::ClientReply(resp) => Ok(resp),
            other => Err(unexpected("client_reply", &other)),
        }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}

fn unexpected(expected: &'static str, got: &ReefMessage) -> NetError {
    NetError::UnexpectedResponse {
        expected,
        got: got.kind(),
    }
}

/// Default ALPN protocol identifier (no cluster secret).
pub const REEF_ALPN: &[u8] = b"reef/0";

/// Derive a cluster-specific ALPN from a shared secret.
///
/// The ALPN is `reef/0/<first 16 hex chars of blake3(secret)>`. Nodes with
/// different secrets fail the TLS handshake and never exchange messages.
pub fn cluster_alpn(secret: &[u8]) -> Vec<u8> {
    let hash = blake3::hash(secret);
    let hex = hash.to_hex();
    format!("reef/0/{}", &hex[..16]).into_bytes()
}
