//! Router module for candidate selection.
//!
//! This module turns a requested alias into an ordered candidate list:
//! - Registry lookup (exact, prefix wildcard, catch-all)
//! - Load-balancing over groups of entries sharing an alias
//! - Atomic registry replacement on reload

mod selector;

pub use selector::{RouteDecision, Router, Strategy};
