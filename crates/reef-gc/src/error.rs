//! Error types for garbage collection.

/// Errors that abort a collection pass.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// Failed to access the metadata store.
    #[error("metadata error: {0}")]
    Meta(#[from] reef_meta::MetaError),

    /// Failed to access the payload store.
    #[error("store error: {0}")]
    Store(#[from] reef_store::StoreError),
}
