//! Error types for the engine.

use reef_placement::PlacementError;
use reef_types::{ContainerId, ErrorKind, ObjectAddress};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),

    /// Failed to access the payload store.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// Network transport error.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),

    /// Cluster membership or epoch error.
    #[error("cluster error: {0}")]
    Cluster(#[from] reef_cluster::ClusterError),

    /// The placement policy is invalid or cannot be satisfied.
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    /// Garbage collection failed.
    #[error("gc error: {0}")]
    Gc(#[from] reef_gc::GcError),

    /// Replica reconciliation failed.
    #[error("replication error: {0}")]
    Replication(#[from] reef_replication::ReplicationError),

    /// The container does not exist or was deleted.
    #[error("container not found: {0}")]
    ContainerNotFound(ContainerId),

    /// No live copy of the object exists.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectAddress),

    /// The requester may not perform the operation.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Fewer replicas than the policy requires acknowledged a write.
    #[error("placement failed: need {needed} replicas, {acked} acknowledged")]
    PlacementFailed {
        /// Copies the policy requires.
        needed: usize,
        /// Copies that were acknowledged.
        acked: usize,
    },

    /// A header or payload failed its integrity check.
    #[error("data corruption in {address}: {reason}")]
    DataCorruption {
        /// The object read.
        address: ObjectAddress,
        /// What did not match.
        reason: String,
    },

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A remote node answered with an error.
    #[error("{kind} error from remote node: {message}")]
    Remote {
        /// Category reported by the remote node.
        kind: ErrorKind,
        /// Remote error message.
        message: String,
    },
}

impl EngineError {
    /// Caller-facing category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ContainerNotFound(_) | EngineError::ObjectNotFound(_) => {
                ErrorKind::NotFound
            }
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::PlacementFailed { .. }
            | EngineError::Placement(PlacementError::InsufficientNodes { .. }) => {
                ErrorKind::InsufficientNodes
            }
            EngineError::Placement(_) | EngineError::InvalidRequest(_) => {
                ErrorKind::InvalidRequest
            }
            EngineError::DataCorruption { .. } => ErrorKind::DataCorruption,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Remote { kind, .. } => *kind,
            EngineError::Meta(_)
            | EngineError::Store(_)
            | EngineError::Net(_)
            | EngineError::Cluster(_)
            | EngineError::Gc(_)
            | EngineError::Replication(_) => ErrorKind::Internal,
        }
    }

    /// Whether this is a not-found error, local or remote.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
