//! Error types for the cluster crate.

use reef_types::NodeId;

/// Errors produced by the cluster subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The requested node was not found in the cluster state.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// No seed answered the join request.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// The epoch cannot advance any further.
    #[error("epoch {0} cannot be advanced")]
    EpochOverflow(reef_types::Epoch),

    /// A network-level error.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),

    /// An error from the metadata store.
    #[error("meta store error: {0}")]
    Meta(#[from] reef_meta::MetaError),
}
