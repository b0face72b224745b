//! Task orchestration core for an assistive navigation badge.
//!
//! A task is a directed graph of navigation, interaction, recognition and
//! decision nodes. The [`Orchestrator`] runs one graph at a time, lets a
//! short inserted task pre-empt it, keeps every state change durable and
//! falls back to a failsafe when a collaborator stops answering.

// Core infrastructure
pub mod core;
pub mod storage;

// Task model and runtime state
pub mod cache;
pub mod graph;
pub mod state;

// Execution
pub mod executor;
pub mod insertion;
pub mod orchestrator;

// Failure handling and housekeeping
pub mod cleanup;
pub mod failsafe;
pub mod recovery;
pub mod report;

pub use crate::core::{EngineConfig, EngineError, Result};
pub use cache::CacheManager;
pub use executor::{
    EventSink, FnHandler, HandlerRegistry, NodeContext, NodeExecutor, NodeHandler, NodeOutput,
    NodeResult, RuntimeEvent,
};
pub use failsafe::{RecoveryPrompt, RestartContext};
pub use graph::{Edge, GraphLoader, NodeType, TaskGraph, TaskNode};
pub use insertion::InsertedTaskQueue;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, TaskKind};
pub use recovery::RecoveryOutcome;
pub use report::{ReportTransport, TaskReport};
pub use state::{GraphStatus, NodeStatus, StateManager, TaskState};
