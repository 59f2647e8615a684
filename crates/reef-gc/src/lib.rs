//! Garbage collection for Reef.
//!
//! The [`GarbageCollector`] is the only component that removes object data.
//! A pass runs in two phases:
//!
//! 1. **Mark**: every local object that expired before the current epoch, or
//!    whose container was deleted at an earlier epoch, gets a durable mark.
//! 2. **Sweep**: every mark is executed under the object's record lock:
//!    payload, header and replica locations are removed, then the mark.
//!
//! Marks survive restarts, so a pass interrupted half-way is completed by
//! the next one.

mod collector;
mod error;

pub use collector::{GarbageCollector, GcConfig, GcHandle, GcSummary, start};
pub use error::GcError;
