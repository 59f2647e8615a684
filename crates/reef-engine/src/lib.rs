//! Node orchestrator tying all Reef components together.
//!
//! The [`ReefNode`] owns the local stores, the cluster view, the epoch clock
//! and the background tasks, and exposes the container registry and the
//! object write/read paths. It is also the node's [`MessageHandler`]: every
//! inbound protocol message is answered here.
//!
//! Gateways and the `reefd` CLI depend on the [`ReefEngine`] trait rather
//! than on `ReefNode`, so a local node and a remote one ([`ReefClient`]) are
//! interchangeable.
//!
//! [`MessageHandler`]: reef_net::MessageHandler

pub mod client;
pub mod engine;
pub mod error;
mod handler;
pub mod node;
pub mod registry;
pub mod wait;

pub use client::ReefClient;
pub use engine::ReefEngine;
pub use error::EngineError;
pub use node::{NodeTasks, ReefNode, ReefNodeConfig};
pub use registry::{ContainerInfo, placement_policy_from_info};

#[cfg(test)]
mod tests;
