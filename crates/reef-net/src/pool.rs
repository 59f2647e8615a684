//! Connection cache with per-peer dialing.
//!
//! The cache map is only locked for lookups and inserts. Dialing happens
//! under a lock owned by the peer being dialed, so a peer that never answers
//! holds up callers of that peer alone, and only until the connect timeout.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::NetError;

/// Default time limit for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached connections keyed by peer.
pub(crate) struct ConnectionPool<K, C> {
    connections: Mutex<HashMap<K, C>>,
    /// One gate per peer: concurrent callers must not each dial the same
    /// peer and overwrite one another in the cache.
    gates: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    connect_timeout: Duration,
}

impl<K, C> ConnectionPool<K, C>
where
    K: Eq + Hash + Copy + std::fmt::Debug,
    C: Clone,
{
    pub(crate) fn new(connect_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Return the live cached connection to `key`, or establish one with
    /// `dial`.
    ///
    /// `alive` tells whether a cached connection may still be used.
    pub(crate) async fn get<A, F, Fut>(&self, key: K, alive: A, dial: F) -> Result<C, NetError>
    where
        A: Fn(&C) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, NetError>>,
    {
        if let Some(conn) = self.cached(&key, &alive).await {
            return Ok(conn);
        }

        let gate = self.gate(key).await;
        let _dialing = gate.lock().await;
        // Someone else may have connected while we waited for the gate.
        if let Some(conn) = self.cached(&key, &alive).await {
            return Ok(conn);
        }

        debug!(peer = ?key, "dialing peer");
        let conn = match tokio::time::timeout(self.connect_timeout, dial()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetError::Connect(format!(
                    "timed out after {} ms",
                    self.connect_timeout.as_millis()
                )));
            }
        };
        self.connections.lock().await.insert(key, conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection to `key`.
    pub(crate) async fn remove(&self, key: &K) {
        self.connections.lock().await.remove(key);
    }

    async fn cached<A: Fn(&C) -> bool>(&self, key: &K, alive: &A) -> Option<C> {
        let cache = self.connections.lock().await;
        cache.get(key).filter(|conn| alive(conn)).cloned()
    }

    async fn gate(&self, key: K) -> Arc<Mutex<()>> {
        self.gates.lock().await.entry(key).or_default().clone()
    }
}
