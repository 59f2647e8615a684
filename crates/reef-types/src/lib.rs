//! Shared types and identifiers for Reef.
//!
//! This crate defines the core records exchanged by every other crate in the
//! workspace:
//!
//! - identifiers ([`ContainerId`], [`ObjectId`], [`NodeId`], [`OwnerId`], [`PayloadHash`]),
//! - storage records ([`Container`], [`ContainerRecord`], [`ObjectHeader`], [`ObjectAddress`]),
//! - placement policy structures ([`PlacementRule`] and friends, see [`policy`]),
//! - cluster types ([`NodeRecord`], [`NodeState`], [`ClusterEvent`]),
//! - the caller-facing [`ErrorKind`] taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod events;
pub mod policy;

pub use policy::{Clause, Filter, FilterExpr, Operation, PlacementRule, Replica, Selector};

/// Logical time of the cluster. Advanced only by an explicit tick.
pub type Epoch = u64;

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when parsing a hex-encoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier {input:?}: expected 64 hex characters")]
pub struct ParseIdError {
    /// The rejected input.
    pub input: String,
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(s.trim(), &mut bytes).map_err(|_| ParseIdError {
                    input: s.to_string(),
                })?;
                Ok(Self(bytes))
            }
        }
    };
}

define_id!(
    /// Identifier of a container: blake3 over its identifying fields and a nonce.
    ContainerId
);

define_id!(
    /// Content-derived identifier of an object: blake3 over its header fields.
    ObjectId
);

define_id!(
    /// Identifier for a storage node, derived from its transport public key.
    NodeId
);

define_id!(
    /// Opaque identity of a container or object owner.
    OwnerId
);

define_id!(
    /// BLAKE3 hash of an object payload.
    PayloadHash
);

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

/// Basic access control preset attached to a container.
///
/// Each preset has a well-known 32-bit code, rendered as upper-case hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasicAcl {
    /// Only the owner may read or write.
    #[default]
    Private,
    /// Anyone may read, only the owner may write.
    PublicRead,
    /// Anyone may read and write.
    PublicReadWrite,
    /// Anyone may read and add objects.
    PublicAppend,
}

impl BasicAcl {
    /// All presets, in code order.
    pub const ALL: [BasicAcl; 4] = [
        BasicAcl::Private,
        BasicAcl::PublicRead,
        BasicAcl::PublicReadWrite,
        BasicAcl::PublicAppend,
    ];

    /// Return the 32-bit code of this preset.
    pub fn bits(self) -> u32 {
        match self {
            BasicAcl::Private => 0x1C8C_8CCC,
            BasicAcl::PublicRead => 0x1FBF_8CFF,
            BasicAcl::PublicReadWrite => 0x1FBF_BFFF,
            BasicAcl::PublicAppend => 0x1FBF_9FFF,
        }
    }

    /// Look a preset up by its 32-bit code.
    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|acl| acl.bits() == bits)
    }

    /// Return the well-known name of this preset.
    pub fn name(self) -> &'static str {
        match self {
            BasicAcl::Private => "private",
            BasicAcl::PublicRead => "public-read",
            BasicAcl::PublicReadWrite => "public-read-write",
            BasicAcl::PublicAppend => "public-append",
        }
    }

    /// Whether a requester may read objects under this preset.
    pub fn allows_read(self, is_owner: bool) -> bool {
        is_owner || self != BasicAcl::Private
    }

    /// Whether a requester may put objects under this preset.
    pub fn allows_write(self, is_owner: bool) -> bool {
        is_owner || matches!(self, BasicAcl::PublicReadWrite | BasicAcl::PublicAppend)
    }
}

impl fmt::Display for BasicAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X} ({})", self.bits(), self.name())
    }
}

/// Error returned when an ACL string is neither a known name nor a known code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown basic ACL: {0}")]
pub struct ParseAclError(pub String);

impl FromStr for BasicAcl {
    type Err = ParseAclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(acl) = Self::ALL
            .into_iter()
            .find(|acl| acl.name().eq_ignore_ascii_case(trimmed))
        {
            return Ok(acl);
        }
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        u32::from_str_radix(digits, 16)
            .ok()
            .and_then(Self::from_bits)
            .ok_or_else(|| ParseAclError(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// A named namespace for objects carrying its placement policy and ACL.
///
/// Immutable once created. Deletion is recorded on the wrapping
/// [`ContainerRecord`], never on the container itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Identifier derived from the other fields.
    pub id: ContainerId,
    /// Owner of the container.
    pub owner: OwnerId,
    /// Placement policy every object in the container follows.
    pub placement_policy: PlacementRule,
    /// Basic access control preset.
    pub basic_acl: BasicAcl,
    /// Optional human-readable name.
    pub name: Option<String>,
    /// Epoch at which the container was created.
    pub created_epoch: Epoch,
    /// Random bytes making two otherwise identical containers distinct.
    pub nonce: [u8; 16],
}

impl Container {
    /// Build a container and derive its identifier.
    pub fn new(
        owner: OwnerId,
        placement_policy: PlacementRule,
        basic_acl: BasicAcl,
        name: Option<String>,
        created_epoch: Epoch,
        nonce: [u8; 16],
    ) -> Self {
        let mut container = Self {
            id: ContainerId::from([0u8; 32]),
            owner,
            placement_policy,
            basic_acl,
            name,
            created_epoch,
            nonce,
        };
        container.id = container.compute_id();
        container
    }

    /// Recompute the identifier from the container's fields.
    pub fn compute_id(&self) -> ContainerId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.owner.as_bytes());
        hasher.update(self.placement_policy.to_string().as_bytes());
        hasher.update(&self.basic_acl.bits().to_be_bytes());
        if let Some(name) = &self.name {
            hasher.update(&[1]);
            hasher.update(name.as_bytes());
        } else {
            hasher.update(&[0]);
        }
        hasher.update(&self.created_epoch.to_be_bytes());
        hasher.update(&self.nonce);
        ContainerId::from(<[u8; 32]>::from(hasher.finalize()))
    }

    /// Whether `requester` owns this container.
    pub fn is_owner(&self, requester: &OwnerId) -> bool {
        self.owner == *requester
    }
}

/// A container together with its deletion state.
///
/// A record with `deleted_at` set is a tombstone: it is kept so that late
/// announcements of the live record cannot bring the container back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// The container.
    pub container: Container,
    /// Epoch at which the container was deleted, if it was.
    pub deleted_at: Option<Epoch>,
}

impl ContainerRecord {
    /// Wrap a freshly created container.
    pub fn live(container: Container) -> Self {
        Self {
            container,
            deleted_at: None,
        }
    }

    /// Return the container's identifier.
    pub fn id(&self) -> ContainerId {
        self.container.id
    }

    /// Whether this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether merging this record into a copy deleted at `deleted_at`
    /// (`None` for live) would change that copy.
    pub fn supersedes(&self, deleted_at: Option<Epoch>) -> bool {
        match (deleted_at, self.deleted_at) {
            (None, Some(_)) => true,
            (Some(theirs), Some(mine)) => mine < theirs,
            _ => false,
        }
    }

    /// Merge another copy of the same container into this one.
    ///
    /// Tombstones win over live records; between two tombstones the earlier
    /// deletion epoch is kept. Returns `true` if `self` changed.
    pub fn merge(&mut self, other: &ContainerRecord) -> bool {
        if self.id() != other.id() {
            return false;
        }
        match (self.deleted_at, other.deleted_at) {
            (None, Some(at)) => {
                self.deleted_at = Some(at);
                true
            }
            (Some(mine), Some(theirs)) if theirs < mine => {
                self.deleted_at = Some(theirs);
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Fully-qualified address of an object: its container and its id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectAddress {
    /// Container holding the object.
    pub container_id: ContainerId,
    /// The object identifier.
    pub object_id: ObjectId,
}

impl ObjectAddress {
    /// Create an address from its parts.
    pub fn new(container_id: ContainerId, object_id: ObjectId) -> Self {
        Self {
            container_id,
            object_id,
        }
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_id, self.object_id)
    }
}

impl fmt::Debug for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectAddress({self})")
    }
}

impl FromStr for ObjectAddress {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cid, oid) = s.split_once('/').ok_or_else(|| ParseIdError {
            input: s.to_string(),
        })?;
        Ok(Self::new(cid.parse()?, oid.parse()?))
    }
}

/// Immutable header of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// Identifier derived from every other header field.
    pub object_id: ObjectId,
    /// Container the object belongs to.
    pub container_id: ContainerId,
    /// Owner who stored the object.
    pub owner: OwnerId,
    /// Hash of the payload bytes.
    pub payload_hash: PayloadHash,
    /// Payload length in bytes.
    pub size: u64,
    /// Epoch at which the object was stored.
    pub created_epoch: Epoch,
    /// Last epoch at which the object is still live.
    pub expire_at: Option<Epoch>,
    /// User-supplied attributes.
    pub attributes: BTreeMap<String, String>,
}

impl ObjectHeader {
    /// Build the header for `payload` and derive its object id.
    pub fn new(
        container_id: ContainerId,
        owner: OwnerId,
        payload: &[u8],
        created_epoch: Epoch,
        expire_at: Option<Epoch>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        let mut header = Self {
            object_id: ObjectId::from([0u8; 32]),
            container_id,
            owner,
            payload_hash: PayloadHash::from_data(payload),
            size: payload.len() as u64,
            created_epoch,
            expire_at,
            attributes,
        };
        header.object_id = header.compute_id();
        header
    }

    /// Recompute the object id from the header fields.
    pub fn compute_id(&self) -> ObjectId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.container_id.as_bytes());
        hasher.update(self.owner.as_bytes());
        hasher.update(self.payload_hash.as_bytes());
        hasher.update(&self.size.to_be_bytes());
        hasher.update(&self.created_epoch.to_be_bytes());
        match self.expire_at {
            Some(epoch) => {
                hasher.update(&[1]);
                hasher.update(&epoch.to_be_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        for (key, value) in &self.attributes {
            hasher.update(&(key.len() as u32).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u32).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        ObjectId::from(<[u8; 32]>::from(hasher.finalize()))
    }

    /// Return the full address of this object.
    pub fn address(&self) -> ObjectAddress {
        ObjectAddress::new(self.container_id, self.object_id)
    }

    /// Whether the object is expired at `current` (strictly past `expire_at`).
    pub fn is_expired(&self, current: Epoch) -> bool {
        matches!(self.expire_at, Some(expire_at) if current > expire_at)
    }

    /// Whether the stored id matches the header fields.
    pub fn verify_id(&self) -> bool {
        self.compute_id() == self.object_id
    }

    /// Whether `payload` matches the recorded hash and size.
    pub fn verify_payload(&self, payload: &[u8]) -> bool {
        payload.len() as u64 == self.size && PayloadHash::from_data(payload) == self.payload_hash
    }
}

// ---------------------------------------------------------------------------
// Cluster types
// ---------------------------------------------------------------------------

/// Health state of a node as seen by the local monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Probes succeed.
    Healthy,
    /// Recent probes failed but the failure threshold is not reached yet.
    Suspect,
    /// The node is excluded from placement until it recovers.
    Unreachable,
}

/// A storage node known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique identifier for this node.
    pub node_id: NodeId,
    /// Dialable address, transport specific.
    pub endpoint: String,
    /// Attributes used by placement filters (e.g. `Country`, `City`).
    pub attributes: BTreeMap<String, String>,
    /// Current health state.
    pub state: NodeState,
}

impl NodeRecord {
    /// Create a healthy node record with no attributes.
    pub fn new(node_id: NodeId, endpoint: impl Into<String>) -> Self {
        Self {
            node_id,
            endpoint: endpoint.into(),
            attributes: BTreeMap::new(),
            state: NodeState::Healthy,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Whether placement may select this node.
    pub fn reachable(&self) -> bool {
        self.state != NodeState::Unreachable
    }
}

/// Events emitted by the cluster state on membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A node was added to the local view.
    NodeJoined(NodeRecord),
    /// A node crossed the failure threshold.
    NodeUnreachable(NodeId),
    /// A previously unreachable node is healthy again.
    NodeReturned(NodeId),
    /// The local epoch advanced (by tick or by observing a peer).
    EpochAdvanced(Epoch),
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Caller-facing error categories, shared by the engine and its adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The container or object does not exist (or is expired).
    NotFound,
    /// The requester is not allowed to perform the operation.
    Forbidden,
    /// Placement could not be satisfied or the write quorum was not reached.
    InsufficientNodes,
    /// A stored or received payload failed its integrity check.
    DataCorruption,
    /// A bounded wait expired.
    Timeout,
    /// The request itself is malformed.
    InvalidRequest,
    /// Any other failure.
    Internal,
}

impl ErrorKind {
    /// HTTP status code a gateway should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::InsufficientNodes => 503,
            ErrorKind::DataCorruption => 500,
            ErrorKind::Timeout => 504,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Internal => 500,
        }
    }

    /// S3 error code for an object-level failure.
    pub fn s3_code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NoSuchKey",
            ErrorKind::Forbidden => "AccessDenied",
            ErrorKind::InsufficientNodes => "ServiceUnavailable",
            ErrorKind::DataCorruption => "InternalError",
            ErrorKind::Timeout => "RequestTimeout",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InsufficientNodes => "insufficient nodes",
            ErrorKind::DataCorruption => "data corruption",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}
