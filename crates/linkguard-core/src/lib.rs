//! linkguard core: the link-name rule language, the address pattern tree, and
//! the shared error surface.
//!
//! This crate carries no runtime or transport dependencies. The policy crate
//! layers connection lifecycle, admission counting, and the identity authority
//! on top of it.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here. Every malformed rule
//! surfaces as `GateError` so the caller can fail closed instead of crashing.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod pattern_tree;
pub mod rules;

/// Shared result type.
pub use error::{Condition, GateError, Result};
pub use pattern_tree::PatternTree;
pub use rules::{LinkMatcher, RuleSet};
