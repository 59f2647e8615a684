//! In-memory payload storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use reef_types::{ObjectAddress, PayloadHash};
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{PayloadStore, StorageUsage};

/// In-memory payload store backed by a `RwLock<HashMap>`.
///
/// Used by tests and by nodes running in memory-only mode. Tracks total
/// bytes stored against a configurable maximum.
pub struct MemoryStore {
    payloads: RwLock<HashMap<ObjectAddress, Bytes>>,
    max_bytes: u64,
}

impl MemoryStore {
    /// Create a new in-memory store with the given capacity limit.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            payloads: RwLock::new(HashMap::new()),
            max_bytes,
        }
    }

    fn used_bytes_unlocked(map: &HashMap<ObjectAddress, Bytes>) -> u64 {
        map.values().map(|v| v.len() as u64).sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait::async_trait]
impl PayloadStore for MemoryStore {
    async fn put(&self, addr: ObjectAddress, data: Bytes) -> Result<(), StoreError> {
        let mut map = self.payloads.write().expect("lock poisoned");
        let used = Self::used_bytes_unlocked(&map);
        let data_len = data.len() as u64;

        let existing_len = map.get(&addr).map_or(0, |v| v.len() as u64);
        let net_increase = data_len.saturating_sub(existing_len);

        if used.saturating_add(net_increase) > self.max_bytes {
            return Err(StoreError::CapacityExceeded {
                needed: net_increase,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        debug!(%addr, size = data.len(), "storing payload in memory");
        map.insert(addr, data);
        Ok(())
    }

    async fn get(&self, addr: ObjectAddress) -> Result<Option<Bytes>, StoreError> {
        let map = self.payloads.read().expect("lock poisoned");
        Ok(map.get(&addr).cloned())
    }

    async fn delete(&self, addr: ObjectAddress) -> Result<(), StoreError> {
        let mut map = self.payloads.write().expect("lock poisoned");
        if map.remove(&addr).is_some() {
            debug!(%addr, "deleted payload from memory");
        }
        Ok(())
    }

    async fn contains(&self, addr: ObjectAddress) -> Result<bool, StoreError> {
        let map = self.payloads.read().expect("lock poisoned");
        Ok(map.contains_key(&addr))
    }

    async fn list(&self) -> Result<Vec<ObjectAddress>, StoreError> {
        let map = self.payloads.read().expect("lock poisoned");
        Ok(map.keys().copied().collect())
    }

    async fn usage(&self) -> Result<StorageUsage, StoreError> {
        let map = self.payloads.read().expect("lock poisoned");
        Ok(StorageUsage {
            objects: map.len() as u64,
            used_bytes: Self::used_bytes_unlocked(&map),
        })
    }

    async fn verify(
        &self,
        addr: ObjectAddress,
        expected: &PayloadHash,
    ) -> Result<bool, StoreError> {
        let map = self.payloads.read().expect("lock poisoned");
        match map.get(&addr) {
            Some(data) => Ok(PayloadHash::from_data(data) == *expected),
            None => Err(StoreError::NotFound(addr)),
        }
    }
}
