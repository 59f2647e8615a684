//! Striped per-record locks.

use reef_types::ObjectAddress;
use tokio::sync::{Mutex, MutexGuard};

/// Default number of stripes.
const DEFAULT_STRIPES: usize = 256;

/// A fixed table of async mutexes indexed by object address.
///
/// Two operations on the same address always contend on the same stripe;
/// operations on different addresses usually do not. Holders must not
/// acquire a second stripe while holding one.
pub struct RecordLocks {
    stripes: Vec<Mutex<()>>,
}

impl RecordLocks {
    /// Create a lock table with `stripes` entries (at least one).
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Acquire the lock guarding `addr`.
    pub async fn lock(&self, addr: &ObjectAddress) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(addr)].lock().await
    }

    fn stripe_of(&self, addr: &ObjectAddress) -> usize {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&addr.object_id.as_bytes()[..8]);
        (u64::from_le_bytes(bytes) % self.stripes.len() as u64) as usize
    }
}

impl Default for RecordLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl std::fmt::Debug for RecordLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLocks")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
