//! Core trait for payload storage.

use bytes::Bytes;
use reef_types::{ObjectAddress, PayloadHash};

use crate::error::StoreError;

/// Space accounting for a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    /// Number of stored payloads.
    pub objects: u64,
    /// Bytes currently used by payloads.
    pub used_bytes: u64,
}

/// Trait for storing and retrieving object payloads on one node.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Data is passed as [`Bytes`] to avoid copies between the network layer
/// and the store.
#[async_trait::async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store (or overwrite) the payload of an object.
    async fn put(&self, addr: ObjectAddress, data: Bytes) -> Result<(), StoreError>;

    /// Retrieve a payload. Returns `None` if not found.
    async fn get(&self, addr: ObjectAddress) -> Result<Option<Bytes>, StoreError>;

    /// Delete a payload. Deleting a missing payload is not an error.
    async fn delete(&self, addr: ObjectAddress) -> Result<(), StoreError>;

    /// Check whether a payload exists.
    async fn contains(&self, addr: ObjectAddress) -> Result<bool, StoreError>;

    /// List every stored address.
    async fn list(&self) -> Result<Vec<ObjectAddress>, StoreError>;

    /// Report how much space payloads use.
    async fn usage(&self) -> Result<StorageUsage, StoreError>;

    /// Re-hash a stored payload and compare it to `expected`.
    ///
    /// Returns [`StoreError::NotFound`] if the payload is absent.
    async fn verify(&self, addr: ObjectAddress, expected: &PayloadHash)
    -> Result<bool, StoreError>;
}
