//! Type-safe event bus for intra-node pub/sub.
//!
//! The [`EventBus`] lets a component emit typed events (an object was stored,
//! a GC pass finished, a replica turned out corrupt) and any other component
//! subscribe to one event type without direct coupling.
//!
//! Each event type is a distinct struct implementing the [`Event`] marker
//! trait. The bus keeps one `tokio::sync::broadcast` channel per type,
//! created lazily on the first `subscribe()`.
//!
//! # Example
//!
//! ```rust
//! use reef_types::events::{EventBus, GcPassCompleted};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe::<GcPassCompleted>();
//!
//! bus.emit(GcPassCompleted { epoch: 3, pass: 1, collected: 2 });
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.collected, 2);
//! # });
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{ContainerId, Epoch, NodeId, ObjectAddress};

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Whether an event originated locally or was received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOrigin {
    /// The event was produced by this node.
    Local,
    /// The event was learned from a peer.
    Remote(NodeId),
}

/// A client put reached its write quorum.
#[derive(Clone, Debug)]
pub struct ObjectStored {
    /// Address of the stored object.
    pub address: ObjectAddress,
    /// Nodes that acknowledged a replica.
    pub holders: Vec<NodeId>,
}
impl Event for ObjectStored {}

/// A replica pushed by a peer was verified and stored locally.
#[derive(Clone, Debug)]
pub struct ReplicaReceived {
    /// Address of the replica.
    pub address: ObjectAddress,
    /// Node that pushed it.
    pub from: NodeId,
}
impl Event for ReplicaReceived {}

/// A replica failed its integrity check.
#[derive(Clone, Debug)]
pub struct ReplicaCorrupted {
    /// Address of the corrupt replica.
    pub address: ObjectAddress,
    /// Node holding the corrupt copy.
    pub node_id: NodeId,
}
impl Event for ReplicaCorrupted {}

/// The replicator restored a missing replica on a node.
#[derive(Clone, Debug)]
pub struct ReplicaRestored {
    /// Address of the object.
    pub address: ObjectAddress,
    /// Node that received the copy.
    pub target: NodeId,
}
impl Event for ReplicaRestored {}

/// Why the garbage collector removed an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CollectReason {
    /// The object's expiration epoch has passed.
    Expired,
    /// The object's container was deleted.
    ContainerDeleted,
}

/// The garbage collector removed an object from this node.
#[derive(Clone, Debug)]
pub struct ObjectCollected {
    /// Address of the removed object.
    pub address: ObjectAddress,
    /// Why it was removed.
    pub reason: CollectReason,
}
impl Event for ObjectCollected {}

/// A garbage collection pass finished.
#[derive(Clone, Debug)]
pub struct GcPassCompleted {
    /// Epoch the pass ran at.
    pub epoch: Epoch,
    /// Sequence number of the pass since the collector started.
    pub pass: u64,
    /// Objects removed during the pass.
    pub collected: usize,
}
impl Event for GcPassCompleted {}

/// A container record was created, deleted or learned from a peer.
#[derive(Clone, Debug)]
pub struct ContainerChanged {
    /// The container.
    pub container_id: ContainerId,
    /// Whether the record is now a tombstone.
    pub tombstone: bool,
    /// Where the change came from.
    pub origin: EventOrigin,
}
impl Event for ContainerChanged {}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default broadcast channel capacity per event type.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct EventBusInner {
    /// `TypeId` → `Box<broadcast::Sender<E>>`.
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Type-safe publish/subscribe event bus.
///
/// Cheap to clone (inner `Arc`). Each event type gets its own independent
/// channel, so subscribers of `GcPassCompleted` never see `ObjectStored`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusInner>>,
}

impl EventBus {
    /// Create a new empty event bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventBusInner {
                channels: HashMap::new(),
            })),
        }
    }

    /// Emit an event to all current subscribers of type `E`.
    ///
    /// Non-blocking. Without subscribers the event is dropped.
    pub fn emit<E: Event>(&self, event: E) {
        let type_id = TypeId::of::<E>();
        let inner = self.inner.lock().expect("event bus lock poisoned");

        if let Some(sender) = inner
            .channels
            .get(&type_id)
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // An error only means nobody is listening right now.
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let type_id = TypeId::of::<E>();
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let sender = inner
            .channels
            .entry(type_id)
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");

        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &inner.channels.len())
            .finish()
    }
}

/// Typed receiver for a specific event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once every sender is gone. Lagged events are skipped
    /// with a warning.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
