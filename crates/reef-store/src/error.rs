//! Error types for payload storage operations.

use reef_types::ObjectAddress;

/// Errors that can occur during payload storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested payload was not found.
    #[error("payload not found: {0}")]
    NotFound(ObjectAddress),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The store has reached its capacity limit.
    #[error("store capacity exceeded: need {needed} bytes, only {available} available")]
    CapacityExceeded {
        /// Bytes needed for the operation.
        needed: u64,
        /// Bytes currently available.
        available: u64,
    },
}
