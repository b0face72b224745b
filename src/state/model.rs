use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Complete => "complete",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    /// Complete or skipped: the node no longer blocks graph completion
    pub fn is_done(&self) -> bool {
        matches!(self, NodeStatus::Complete | NodeStatus::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a whole task.
///
/// `Paused` only ever means "paused for an inserted task".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Complete,
    Error,
    Cancelled,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Pending => "pending",
            GraphStatus::Running => "running",
            GraphStatus::Paused => "paused",
            GraphStatus::Complete => "complete",
            GraphStatus::Error => "error",
            GraphStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphStatus::Complete | GraphStatus::Error | GraphStatus::Cancelled
        )
    }

    /// The state machine: pending → running → {paused ⇄ running}* → terminal.
    pub fn can_transition_to(&self, next: GraphStatus) -> bool {
        use GraphStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Complete) | (Running, Error) | (Running, Cancelled) => true,
            (Paused, Complete) | (Paused, Error) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    #[serde(default = "pending")]
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn pending() -> NodeStatus {
    NodeStatus::Pending
}

impl NodeState {
    pub fn new<S: Into<String>>(node_id: S) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            output: Map::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertedTaskInfo {
    pub is_active: bool,
    /// Resume point of the host task
    pub paused_main_node: Option<String>,
    pub inserted_task_id: Option<String>,
    pub pause_time: Option<DateTime<Utc>>,
}

/// Canonical state of one task. Node states keep graph declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    #[serde(default)]
    pub graph_status: GraphStatus,
    #[serde(default, alias = "current_node")]
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeState>,
    #[serde(default)]
    pub inserted_task: InsertedTaskInfo,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default = "Utc::now", alias = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    pub fn new<S: Into<String>>(task_id: S, node_ids: &[String]) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            graph_status: GraphStatus::Pending,
            current_node_id: None,
            nodes: node_ids.iter().map(NodeState::new).collect(),
            inserted_task: InsertedTaskInfo::default(),
            progress: 0,
            started_at: None,
            paused_at: None,
            completed_at: None,
            context: Map::new(),
            updated_at: now,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeState> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeState> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    fn ids_with(&self, status: NodeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn completed_nodes(&self) -> Vec<String> {
        self.ids_with(NodeStatus::Complete)
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        self.ids_with(NodeStatus::Failed)
    }

    /// Floor of completed / total * 100; only `complete` nodes count.
    pub fn compute_progress(&self) -> u8 {
        if self.nodes.is_empty() {
            return 0;
        }
        let completed = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Complete)
            .count();
        (completed * 100 / self.nodes.len()) as u8
    }

    /// Derive the graph status from node statuses. Terminal and paused tasks are left alone.
    pub(crate) fn roll_up(&mut self, now: DateTime<Utc>) {
        if self.graph_status.is_terminal() || self.graph_status == GraphStatus::Paused {
            return;
        }
        if self.nodes.iter().any(|n| n.status == NodeStatus::Failed) {
            self.graph_status = GraphStatus::Error;
        } else if !self.nodes.is_empty() && self.nodes.iter().all(|n| n.status.is_done()) {
            self.graph_status = GraphStatus::Complete;
            self.completed_at = Some(now);
        } else if self.nodes.iter().any(|n| n.status != NodeStatus::Pending) {
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
            self.graph_status = GraphStatus::Running;
        }
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            task_id: self.task_id.clone(),
            graph_status: self.graph_status,
            current_node: self.current_node_id.clone(),
            completed_nodes: self.completed_nodes(),
            failed_nodes: self.failed_nodes(),
            inserted_task_active: self.inserted_task.is_active,
            progress: self.progress,
            nodes_total: self.nodes.len(),
            timestamp: self.updated_at,
        }
    }
}

/// Compact, user-facing view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub task_id: String,
    pub graph_status: GraphStatus,
    pub current_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub inserted_task_active: bool,
    pub progress: u8,
    pub nodes_total: usize,
    pub timestamp: DateTime<Utc>,
}

/// Normalise a node output into the map stored on [`NodeState`].
pub fn output_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_table() {
        use GraphStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Complete.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn test_progress_is_floored() {
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let mut state = TaskState::new("t", &ids);
        state.nodes[0].status = NodeStatus::Complete;
        assert_eq!(state.compute_progress(), 33);
        state.nodes[1].status = NodeStatus::Skipped;
        assert_eq!(state.compute_progress(), 33);
        state.nodes[2].status = NodeStatus::Complete;
        assert_eq!(state.compute_progress(), 66);
    }

    #[test]
    fn test_tolerant_deserialization() {
        let state: TaskState = serde_json::from_value(json!({
            "task_id": "legacy",
            "current_node": "b",
            "nodes": [{"node_id": "a", "status": "complete"}, {"node_id": "b"}],
            "timestamp": "2025-03-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(state.graph_status, GraphStatus::Pending);
        assert_eq!(state.current_node_id.as_deref(), Some("b"));
        assert_eq!(state.nodes[1].status, NodeStatus::Pending);
        assert!(!state.inserted_task.is_active);
        assert!(state.context.is_empty());
    }

    #[test]
    fn test_output_map_wraps_scalars() {
        assert_eq!(output_map(json!(5)).get("value"), Some(&json!(5)));
        assert!(output_map(Value::Null).is_empty());
        assert_eq!(output_map(json!({"k": 1})).get("k"), Some(&json!(1)));
    }
}
