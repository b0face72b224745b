//! Canonical task and node state

pub mod manager;
pub mod model;

pub use manager::StateManager;
pub use model::{
    output_map, GraphStatus, InsertedTaskInfo, NodeState, NodeStatus, StateSummary, TaskState,
};
