//! Local payload storage for Reef.
//!
//! This crate defines the [`PayloadStore`] trait that holds object payloads
//! on a single node, keyed by [`ObjectAddress`](reef_types::ObjectAddress),
//! along with two backends:
//!
//! - [`MemoryStore`]: in-memory storage backed by a `RwLock<HashMap>`.
//! - [`FileStore`]: one file per object under a per-container fan-out.
//!
//! Headers live in the metadata store; integrity is checked by the caller
//! against the header's payload hash (see [`PayloadStore::verify`]).
//!
//! [`RecordLocks`] serializes mutations of a single object address across
//! the put path, inbound replication and garbage collection.

mod error;
mod file_store;
mod locks;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_store::FileStore;
pub use locks::RecordLocks;
pub use memory_store::MemoryStore;
pub use traits::{PayloadStore, StorageUsage};
