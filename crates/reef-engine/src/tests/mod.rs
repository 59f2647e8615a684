//! Tests for the reef-engine crate.

mod helpers;
