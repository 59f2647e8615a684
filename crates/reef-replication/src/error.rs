//! Error types for replication.

/// Errors raised while reconciling.
///
/// Only a failure to list the local objects aborts a pass. Per-object
/// problems (an unreachable target, an unsatisfiable policy, a store error)
/// are counted in the pass summary instead.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),

    /// Failed to access the payload store.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),

    /// Failed to transfer a replica over the network.
    #[error("network error: {0}")]
    Net(#[from] reef_net::NetError),
}
