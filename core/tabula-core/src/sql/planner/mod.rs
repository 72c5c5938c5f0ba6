//! Query planning
//!
//! Lowers sqlparser statements into the crate's own [`Query`].

pub mod logical;
pub mod types;

pub use logical::QueryPlanner;
pub use types::*;
