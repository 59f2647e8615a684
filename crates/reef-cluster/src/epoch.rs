//! The cluster epoch clock.

use std::sync::{Arc, Mutex};

use reef_meta::MetaStore;
use reef_types::Epoch;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ClusterError;

/// Monotonic logical clock shared by the node's components.
///
/// The epoch only moves forward: locally through [`EpochClock::tick`], or by
/// adopting a larger value seen on a peer through [`EpochClock::observe`].
/// Every change is persisted before subscribers are notified.
pub struct EpochClock {
    tx: watch::Sender<Epoch>,
    meta: Option<Arc<MetaStore>>,
    /// Serializes advance-and-persist so stores never go backwards.
    advance: Mutex<()>,
}

impl EpochClock {
    /// A clock starting at `epoch` without persistence.
    pub fn new(epoch: Epoch) -> Self {
        let (tx, _) = watch::channel(epoch);
        Self {
            tx,
            meta: None,
            advance: Mutex::new(()),
        }
    }

    /// A clock restored from, and persisted to, `meta`.
    pub fn restore(meta: Arc<MetaStore>) -> Result<Self, ClusterError> {
        let epoch = meta.get_epoch()?;
        debug!(epoch, "restored epoch");
        let (tx, _) = watch::channel(epoch);
        Ok(Self {
            tx,
            meta: Some(meta),
            advance: Mutex::new(()),
        })
    }

    /// The current epoch.
    pub fn current(&self) -> Epoch {
        *self.tx.borrow()
    }

    /// Advance by one and return the new epoch.
    ///
    /// Fails with [`ClusterError::EpochOverflow`] once the epoch is at
    /// [`Epoch::MAX`], leaving it unchanged.
    pub fn tick(&self) -> Result<Epoch, ClusterError> {
        let _guard = self.advance.lock().expect("epoch lock poisoned");
        let current = self.current();
        let next = current
            .checked_add(1)
            .ok_or(ClusterError::EpochOverflow(current))?;
        self.persist(next)?;
        self.tx.send_replace(next);
        info!(epoch = next, "epoch ticked");
        Ok(next)
    }

    /// Adopt `remote` if it is ahead of the local epoch.
    ///
    /// Returns whether the local epoch moved.
    pub fn observe(&self, remote: Epoch) -> Result<bool, ClusterError> {
        if remote <= self.current() {
            return Ok(false);
        }
        let _guard = self.advance.lock().expect("epoch lock poisoned");
        if remote <= self.current() {
            return Ok(false);
        }
        self.persist(remote)?;
        self.tx.send_replace(remote);
        debug!(epoch = remote, "adopted epoch from peer");
        Ok(true)
    }

    /// Subscribe to epoch changes.
    pub fn subscribe(&self) -> watch::Receiver<Epoch> {
        self.tx.subscribe()
    }

    fn persist(&self, epoch: Epoch) -> Result<(), ClusterError> {
        if let Some(meta) = &self.meta {
            meta.put_epoch(epoch)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EpochClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochClock")
            .field("epoch", &self.current())
            .field("persistent", &self.meta.is_some())
            .finish()
    }
}
