//! Cluster membership, logical time and convergence.
//!
//! This crate provides:
//!
//! - [`ClusterState`]: the local view of every node and its health.
//! - [`EpochClock`]: the persisted, monotonic cluster epoch.
//! - [`health`]: periodic probing that moves peers between
//!   `Healthy`, `Suspect` and `Unreachable`.
//! - [`gossip`]: push-pull anti-entropy of epoch, containers and members,
//!   plus the join handshake.

mod epoch;
mod error;
pub mod gossip;
pub mod health;
mod state;

#[cfg(test)]
mod tests;

pub use epoch::EpochClock;
pub use error::ClusterError;
pub use gossip::{GossipConfig, GossipHandle, GossipState};
pub use health::{HealthConfig, HealthHandle, HealthMonitor};
pub use state::ClusterState;
