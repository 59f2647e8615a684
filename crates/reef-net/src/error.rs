//! Error types for network operations.

use reef_types::NodeId;

/// Errors that can occur during network operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to connect to a remote endpoint.
    #[error("connection error: {0}")]
    Connect(String),

    /// A QUIC connection error.
    #[error("connection error: {0}")]
    Connection(#[from] iroh::endpoint::ConnectionError),

    /// Failed to open a stream.
    #[error("stream open error: {0}")]
    StreamOpen(String),

    /// Error writing to a stream.
    #[error("write error: {0}")]
    Write(#[from] iroh::endpoint::WriteError),

    /// Stream was already closed when trying to finish.
    #[error("stream closed: {0}")]
    ClosedStream(#[from] iroh::endpoint::ClosedStream),

    /// Error reading from a stream.
    #[error("read error: {0}")]
    ReadToEnd(#[from] iroh::endpoint::ReadToEndError),

    /// Error reading exact bytes.
    #[error("read exact error: {0}")]
    ReadExact(#[from] iroh::endpoint::ReadExactError),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A message does not fit in one frame.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size.
        size: usize,
        /// Frame limit.
        max: usize,
    },

    /// The remote endpoint could not be created or bound.
    #[error("endpoint error: {0}")]
    Endpoint(String),

    /// No address is known for the node.
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    /// The node cannot be reached (simulated partition or no handler).
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// The peer answered with a message of the wrong kind.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        /// Expected message kind.
        expected: &'static str,
        /// Received message kind.
        got: &'static str,
    },

    /// The peer did not answer a request.
    #[error("no response from peer")]
    NoResponse,

    /// The peer refused the request.
    #[error("rejected by peer: {0}")]
    Rejected(String),
}
