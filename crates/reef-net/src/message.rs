//! Protocol messages for the Reef network layer.
//!
//! All messages are serialized with postcard and framed with a 4-byte
//! big-endian length prefix.

use std::collections::BTreeMap;

use reef_types::{
    BasicAcl, Container, ContainerId, ContainerRecord, Epoch, ErrorKind, NodeRecord,
    ObjectAddress, ObjectHeader, ObjectId, OwnerId,
};
use serde::{Deserialize, Serialize};

use crate::NetError;

/// Maximum encoded message size: 64 MB.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest object payload a node accepts.
///
/// A replica travels in one frame together with its header and container
/// record, which must fit in the remaining megabyte.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - 1024 * 1024;

/// Protocol messages exchanged between Reef nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReefMessage {
    /// Liveness probe carrying the sender's epoch.
    Ping {
        /// Sender's current epoch.
        epoch: Epoch,
    },
    /// Answer to [`ReefMessage::Ping`].
    Pong {
        /// Responder's current epoch.
        epoch: Epoch,
    },

    /// A node asks a seed to admit it.
    Join {
        /// The joining node's record.
        record: NodeRecord,
    },
    /// Answer to [`ReefMessage::Join`].
    JoinAck {
        /// Every member the seed knows, itself included.
        members: Vec<NodeRecord>,
        /// The seed's current epoch.
        epoch: Epoch,
    },

    /// The sender ticked its epoch (uni-directional).
    EpochAnnounce {
        /// The new epoch.
        epoch: Epoch,
    },
    /// A container was created or deleted (uni-directional).
    ContainerAnnounce {
        /// The record, live or tombstone.
        record: ContainerRecord,
    },

    /// Push-pull anti-entropy: the sender's digest.
    SyncRequest {
        /// Sender's state.
        digest: GossipDigest,
    },
    /// Answer to [`ReefMessage::SyncRequest`] with the responder's digest.
    SyncResponse {
        /// Responder's state.
        digest: GossipDigest,
    },

    /// Store a replica. Expects a [`ReefMessage::ReplicaAck`].
    PutReplica {
        /// The container record, so the receiver never holds an object of an
        /// unknown container.
        container: Option<ContainerRecord>,
        /// The object header.
        header: ObjectHeader,
        /// The payload bytes.
        payload: Vec<u8>,
    },
    /// Answer to [`ReefMessage::PutReplica`].
    ReplicaAck {
        /// The object the ack is for.
        object_id: ObjectId,
        /// Whether the replica was verified and stored.
        ok: bool,
        /// Whether the receiver did not hold the replica before.
        created: bool,
        /// Rejection reason when `ok` is false.
        reason: Option<String>,
    },

    /// Fetch a replica.
    GetReplica {
        /// The requested object.
        address: ObjectAddress,
    },
    /// Answer to [`ReefMessage::GetReplica`].
    ReplicaResponse {
        /// Header and payload, or `None` if the node holds no copy.
        replica: Option<(ObjectHeader, Vec<u8>)>,
    },

    /// Remove a replica written by an aborted put.
    /// Expects a [`ReefMessage::ReplicaDropped`].
    DropReplica {
        /// The object to remove.
        address: ObjectAddress,
    },
    /// Answer to [`ReefMessage::DropReplica`].
    ReplicaDropped {
        /// Whether a copy was removed.
        removed: bool,
    },

    /// Ask whether the node holds a replica.
    HasReplica {
        /// The object asked about.
        address: ObjectAddress,
    },
    /// Answer to [`ReefMessage::HasReplica`].
    ReplicaPresence {
        /// Whether a copy is held.
        present: bool,
    },

    /// An administrative or gateway request.
    Client(ClientRequest),
    /// Answer to [`ReefMessage::Client`].
    ClientReply(ClientResponse),
}

impl ReefMessage {
    /// Encode to postcard bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetError> {
        postcard::to_allocvec(self).map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// Decode from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        postcard::from_bytes(bytes).map_err(|e| NetError::Serialization(e.to_string()))
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReefMessage::Ping { .. } => "ping",
            ReefMessage::Pong { .. } => "pong",
            ReefMessage::Join { .. } => "join",
            ReefMessage::JoinAck { .. } => "join_ack",
            ReefMessage::EpochAnnounce { .. } => "epoch_announce",
            ReefMessage::ContainerAnnounce { .. } => "container_announce",
            ReefMessage::SyncRequest { .. } => "sync_request",
            ReefMessage::SyncResponse { .. } => "sync_response",
            ReefMessage::PutReplica { .. } => "put_replica",
            ReefMessage::ReplicaAck { .. } => "replica_ack",
            ReefMessage::GetReplica { .. } => "get_replica",
            ReefMessage::ReplicaResponse { .. } => "replica_response",
            ReefMessage::DropReplica { .. } => "drop_replica",
            ReefMessage::ReplicaDropped { .. } => "replica_dropped",
            ReefMessage::HasReplica { .. } => "has_replica",
            ReefMessage::ReplicaPresence { .. } => "replica_presence",
            ReefMessage::Client(_) => "client",
            ReefMessage::ClientReply(_) => "client_reply",
        }
    }
}

/// Summary of a node's replicated state, exchanged by gossip.
///
/// Containers travel as versions only. Full records are attached just for
/// the ones the receiver was found to be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    /// Sender's epoch.
    pub epoch: Epoch,
    /// Version of every container record the sender knows, tombstones
    /// included.
    pub containers: Vec<ContainerVersion>,
    /// Records the receiver lacks or holds in an older state.
    pub records: Vec<ContainerRecord>,
    /// Every member the sender knows.
    pub members: Vec<NodeRecord>,
}

/// The state of one container record, as far as merging is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerVersion {
    /// The container.
    pub id: ContainerId,
    /// Deletion epoch, `None` while live.
    pub deleted_at: Option<Epoch>,
}

impl From<&ContainerRecord> for ContainerVersion {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            id: record.id(),
            deleted_at: record.deleted_at,
        }
    }
}

/// Requests served on behalf of clients: gateways and the `reefd` CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Create a container.
    CreateContainer {
        /// Owner of the new container.
        owner: OwnerId,
        /// Placement policy text.
        policy: String,
        /// Basic ACL preset.
        acl: BasicAcl,
        /// Optional human-readable name.
        name: Option<String>,
    },
    /// Fetch a live container.
    GetContainer {
        /// The container.
        id: ContainerId,
    },
    /// List the live containers of an owner.
    ListContainers {
        /// The owner.
        owner: OwnerId,
    },
    /// Delete a container.
    DeleteContainer {
        /// The container.
        id: ContainerId,
        /// Who asks.
        requester: OwnerId,
    },
    /// Store an object.
    PutObject {
        /// Target container.
        container_id: ContainerId,
        /// Who writes.
        owner: OwnerId,
        /// Payload bytes.
        payload: Vec<u8>,
        /// Last epoch at which the object is readable.
        expire_at: Option<Epoch>,
        /// User attributes.
        attributes: BTreeMap<String, String>,
    },
    /// Read an object.
    GetObject {
        /// The object.
        address: ObjectAddress,
        /// Who reads.
        requester: OwnerId,
    },
    /// Read an object header.
    HeadObject {
        /// The object.
        address: ObjectAddress,
        /// Who reads.
        requester: OwnerId,
    },
    /// Advance the cluster epoch by one.
    TickEpoch,
    /// Report the node's current epoch.
    CurrentEpoch,
}

/// Answers to [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    /// A container was created.
    ContainerCreated(ContainerId),
    /// A live container.
    Container(Container),
    /// Container ids.
    Containers(Vec<ContainerId>),
    /// A container was deleted.
    Deleted,
    /// An object was stored.
    ObjectStored(ObjectId),
    /// An object.
    Object {
        /// The header.
        header: ObjectHeader,
        /// The payload.
        payload: Vec<u8>,
    },
    /// An object header.
    Header(ObjectHeader),
    /// An epoch.
    Epoch(Epoch),
    /// The request failed.
    Error {
        /// Caller-facing category.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}
