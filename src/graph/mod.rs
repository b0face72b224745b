//! Task-graph model, loading and dispatch ordering

pub mod condition;
pub mod loader;
pub mod model;

pub use condition::condition_holds;
pub use loader::{execution_order, validate_definition, GraphFormat, GraphLoader, GraphSource};
pub use model::{Edge, NodeType, TaskGraph, TaskNode};
