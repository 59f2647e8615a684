//! Replica reconciliation for Reef.
//!
//! - [`Replicator`]: walks the locally held objects, recomputes each one's
//!   placement against the live cluster view and pushes copies to the
//!   desired nodes that lack one.
//! - [`Throttle`]: token bucket limiting replication bandwidth.

pub mod error;
pub mod replicator;
pub mod throttle;

pub use error::ReplicationError;
pub use replicator::{ReconcileSummary, Replicator, ReplicatorConfig, ReplicatorHandle};
pub use throttle::Throttle;
