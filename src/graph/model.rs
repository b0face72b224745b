use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The nine kinds of workflow step a collaborator can serve.
///
/// Unrecognised type strings are kept as [`NodeType::Unknown`] so a graph
/// still loads and round-trips; executing such a node fails with
/// `UnknownNodeType`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeType {
    Navigation,
    Interaction,
    Observation,
    ConditionCheck,
    ExternalCall,
    MemoryAction,
    EnvironmentalState,
    SceneEntry,
    Decision,
    Unknown(String),
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Navigation,
        NodeType::Interaction,
        NodeType::Observation,
        NodeType::ConditionCheck,
        NodeType::ExternalCall,
        NodeType::MemoryAction,
        NodeType::EnvironmentalState,
        NodeType::SceneEntry,
        NodeType::Decision,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Navigation => "navigation",
            NodeType::Interaction => "interaction",
            NodeType::Observation => "observation",
            NodeType::ConditionCheck => "condition_check",
            NodeType::ExternalCall => "external_call",
            NodeType::MemoryAction => "memory_action",
            NodeType::EnvironmentalState => "environmental_state",
            NodeType::SceneEntry => "scene_entry",
            NodeType::Decision => "decision",
            NodeType::Unknown(other) => other,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, NodeType::Unknown(_))
    }
}

impl FromStr for NodeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "navigation" => NodeType::Navigation,
            "interaction" => NodeType::Interaction,
            "observation" => NodeType::Observation,
            "condition_check" => NodeType::ConditionCheck,
            "external_call" => NodeType::ExternalCall,
            "memory_action" => NodeType::MemoryAction,
            "environmental_state" => NodeType::EnvironmentalState,
            "scene_entry" => NodeType::SceneEntry,
            "decision" => NodeType::Decision,
            other => NodeType::Unknown(other.to_string()),
        })
    }
}

impl TryFrom<String> for NodeType {
    type Error = std::convert::Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeType> for String {
    fn from(value: NodeType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output_schema: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precondition: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postcondition: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub executor_config: Map<String, Value>,
    /// Seconds; the executor default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Advisory only, never acted on by the executor
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    /// Node type (or free-form action label) attempted after a failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TaskNode {
    pub fn new<S: Into<String>>(id: S, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            title: None,
            description: None,
            input_schema: Value::Null,
            output_schema: Value::Null,
            precondition: Vec::new(),
            postcondition: Vec::new(),
            executor_config: Map::new(),
            timeout: None,
            retry_count: 0,
            fallback: None,
        }
    }

    pub fn with_title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_config<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.executor_config.insert(key.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_fallback<S: Into<String>>(mut self, fallback: S) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from_node: String,
    pub to_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
}

impl Edge {
    pub fn new<F: Into<String>, T: Into<String>>(from_node: F, to_node: T) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            condition: None,
            weight: None,
            parallel: None,
        }
    }

    pub fn when<S: Into<String>>(mut self, condition: S) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A loaded, read-only assistance workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub graph_id: String,
    #[serde(alias = "scene_type")]
    pub scene: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<TaskNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskGraph {
    pub fn new<I: Into<String>, S: Into<String>, G: Into<String>>(
        graph_id: I,
        scene: S,
        goal: G,
    ) -> Self {
        Self {
            graph_id: graph_id.into(),
            scene: scene.into(),
            goal: goal.into(),
            name: None,
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_node(mut self, node: TaskNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Chain every node in declaration order with unconditional edges
    pub fn sequential(mut self) -> Self {
        self.edges = self
            .nodes
            .windows(2)
            .map(|pair| Edge::new(pair[0].id.clone(), pair[1].id.clone()))
            .collect();
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Edge> + '_ {
        let node_id = node_id.to_string();
        self.edges.iter().filter(move |e| e.to_node == node_id)
    }

    /// Name shown in reports: the goal, or the id when no goal is set
    pub fn display_name(&self) -> &str {
        if self.goal.is_empty() {
            &self.graph_id
        } else {
            &self.goal
        }
    }
}
