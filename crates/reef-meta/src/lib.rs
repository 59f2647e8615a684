//! Metadata persistence layer wrapping Fjall.
//!
//! [`MetaStore`] provides typed accessors over six Fjall keyspaces:
//!
//! - `containers`: [`ContainerId`] → [`ContainerRecord`] (live or tombstone)
//! - `objects`: container ‖ object → [`ObjectHeader`] of locally held objects
//! - `replicas`: container ‖ object → last known holder list
//! - `members`: [`NodeId`] → [`NodeRecord`]
//! - `gc_marks`: container ‖ object → [`GcMark`], pending collections
//! - `state`: node-wide scalars such as the current epoch
//!
//! [`ContainerId`]: reef_types::ContainerId
//! [`ContainerRecord`]: reef_types::ContainerRecord
//! [`ObjectHeader`]: reef_types::ObjectHeader
//! [`NodeId`]: reef_types::NodeId
//! [`NodeRecord`]: reef_types::NodeRecord

mod error;
mod store;

pub use error::MetaError;
pub use store::{GcMark, MetaStore};
