//! Error types for policy parsing and resolution.

/// Errors returned by [`parse_rule`](crate::parse_rule) and [`resolve`](crate::resolve).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// The policy text does not follow the grammar.
    #[error("invalid placement policy at token {position}: {message}")]
    Syntax {
        /// Index of the offending token.
        position: usize,
        /// What was expected.
        message: String,
    },

    /// The policy parsed but is not self-consistent.
    #[error("invalid placement policy: {0}")]
    Invalid(String),

    /// Not enough reachable nodes match a selector.
    #[error("insufficient nodes for `{selector}`: need {needed}, have {available}")]
    InsufficientNodes {
        /// The selector that could not be satisfied.
        selector: String,
        /// Nodes required.
        needed: usize,
        /// Nodes available after filtering.
        available: usize,
    },
}
