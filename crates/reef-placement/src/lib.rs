//! Placement policies and node selection.
//!
//! A placement policy such as `REP 2 IN X CBF 1 SELECT 2 FROM * AS X` is
//! parsed into a [`PlacementRule`](reef_types::PlacementRule) by
//! [`parse_rule`], then [`resolve`]d against the current node view.
//!
//! Resolution is deterministic: every node computes the same [`Placement`]
//! for the same rule, candidate set and container. Nodes are ranked with
//! rendezvous hashing (HRW), `blake3(pivot ++ node_id)`, so that adding or
//! losing a node only disturbs the placements that actually involved it.

mod error;
mod parser;
mod resolve;

pub use error::PlacementError;
pub use parser::parse_rule;
pub use resolve::{Placement, PlacementVector, hrw_score, hrw_sort, resolve};
