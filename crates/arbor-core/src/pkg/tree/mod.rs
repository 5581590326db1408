//! The install tree and the algorithms that shape it.

pub mod builder;
pub mod family;
pub mod hoist;
pub mod logical;
pub mod node;

pub use builder::{BuildOutcome, SavedDep, TreeBuilder};
pub use family::Family;
pub use hoist::{hoist_children, HoistOutcome};
pub use node::{Node, NodeId, Tree};
