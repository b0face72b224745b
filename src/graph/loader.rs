use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::core::errors::{EngineError, Result, Violation};
use crate::graph::model::TaskGraph;
use crate::storage::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Json,
    Yaml,
}

impl GraphFormat {
    /// `.yaml`/`.yml` are YAML, everything else is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => GraphFormat::Yaml,
            _ => GraphFormat::Json,
        }
    }
}

/// Where a graph definition comes from
#[derive(Debug, Clone)]
pub enum GraphSource {
    Path(PathBuf),
    Text { content: String, format: GraphFormat },
    Value(Value),
}

impl From<&Path> for GraphSource {
    fn from(path: &Path) -> Self {
        GraphSource::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for GraphSource {
    fn from(path: PathBuf) -> Self {
        GraphSource::Path(path)
    }
}

impl From<Value> for GraphSource {
    fn from(value: Value) -> Self {
        GraphSource::Value(value)
    }
}

/// Parses and validates task-graph definitions.
#[derive(Debug, Clone, Default)]
pub struct GraphLoader {
    base_dir: Option<PathBuf>,
}

impl GraphLoader {
    pub fn new() -> Self {
        Self { base_dir: None }
    }

    /// Resolve relative paths against `dir`
    pub fn with_base_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Load a graph, failing with every violation found rather than the first.
    pub fn load<S: Into<GraphSource>>(&self, source: S) -> Result<TaskGraph> {
        let raw = match source.into() {
            GraphSource::Path(path) => {
                let path = self.resolve(&path);
                let content = fs::read_to_string(&path)
                    .map_err(|e| EngineError::io(format!("read graph {}", path.display()), e))?;
                parse_text(&content, GraphFormat::from_path(&path))?
            }
            GraphSource::Text { content, format } => parse_text(&content, format)?,
            GraphSource::Value(value) => value,
        };

        let violations = validate_definition(&raw);
        if !violations.is_empty() {
            warn!(count = violations.len(), "Rejected graph definition");
            return Err(EngineError::validation(violations));
        }

        let graph: TaskGraph = serde_json::from_value(raw)
            .map_err(|e| EngineError::validation(vec![Violation::new("$", e.to_string())]))?;

        if has_cycle(&graph) {
            return Err(EngineError::validation(vec![Violation::new(
                "edges",
                "graph contains a cycle",
            )]));
        }

        debug!(
            graph_id = %graph.graph_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Loaded task graph"
        );
        Ok(graph)
    }

    pub fn load_str(&self, content: &str, format: GraphFormat) -> Result<TaskGraph> {
        self.load(GraphSource::Text {
            content: content.to_string(),
            format,
        })
    }

    /// Load every graph file in a directory; invalid files are logged and skipped.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<TaskGraph>> {
        let dir = self.resolve(dir.as_ref());
        let entries = fs::read_dir(&dir)
            .map_err(|e| EngineError::io(format!("read dir {}", dir.display()), e))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("json") | Some("yaml") | Some("yml")
                    )
            })
            .collect();
        paths.sort();

        let mut graphs = Vec::with_capacity(paths.len());
        for path in paths {
            match self.load(path.clone()) {
                Ok(graph) => graphs.push(graph),
                Err(e) => error!(path = %path.display(), "Skipping graph file: {}", e),
            }
        }
        info!(dir = %dir.display(), count = graphs.len(), "Loaded graph directory");
        Ok(graphs)
    }

    /// Write `graph` as pretty JSON (or YAML by extension), atomically.
    pub fn save<P: AsRef<Path>>(&self, graph: &TaskGraph, destination: P) -> Result<PathBuf> {
        let path = self.resolve(destination.as_ref());
        let bytes = match GraphFormat::from_path(&path) {
            GraphFormat::Json => serde_json::to_vec_pretty(graph)?,
            GraphFormat::Yaml => serde_yaml::to_string(graph)?.into_bytes(),
        };
        atomic_write(&path, &bytes)?;
        debug!(graph_id = %graph.graph_id, path = %path.display(), "Saved task graph");
        Ok(path)
    }
}

fn parse_text(content: &str, format: GraphFormat) -> Result<Value> {
    let parsed = match format {
        GraphFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        GraphFormat::Yaml => serde_yaml::from_str::<Value>(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| EngineError::validation(vec![Violation::new("$", message)]))
}

fn require_string(obj: &serde_json::Map<String, Value>, field: &str, path: &str, out: &mut Vec<Violation>) {
    match obj.get(field) {
        None | Some(Value::Null) => out.push(Violation::new(path, "missing required field")),
        Some(Value::String(s)) if s.trim().is_empty() => {
            out.push(Violation::new(path, "must not be empty"))
        }
        Some(Value::String(_)) => {}
        Some(_) => out.push(Violation::new(path, "must be a string")),
    }
}

fn optional_of(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    path: &str,
    expected: &str,
    check: fn(&Value) -> bool,
    out: &mut Vec<Violation>,
) {
    if let Some(value) = obj.get(field) {
        if !value.is_null() && !check(value) {
            out.push(Violation::new(path, format!("must be {}", expected)));
        }
    }
}

fn is_string_list(value: &Value) -> bool {
    value
        .as_array()
        .map(|items| items.iter().all(Value::is_string))
        .unwrap_or(false)
}

/// Structural validation of a raw definition, collecting every violation.
pub fn validate_definition(raw: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    let root = match raw.as_object() {
        Some(root) => root,
        None => {
            out.push(Violation::new("$", "graph definition must be an object"));
            return out;
        }
    };

    require_string(root, "graph_id", "graph_id", &mut out);
    match root.get("goal") {
        None | Some(Value::Null) => out.push(Violation::new("goal", "missing required field")),
        Some(Value::String(_)) => {}
        Some(_) => out.push(Violation::new("goal", "must be a string")),
    }
    if root.contains_key("scene") {
        require_string(root, "scene", "scene", &mut out);
    } else if root.contains_key("scene_type") {
        require_string(root, "scene_type", "scene_type", &mut out);
    } else {
        out.push(Violation::new("scene", "missing required field"));
    }
    optional_of(root, "name", "name", "a string", Value::is_string, &mut out);
    optional_of(root, "description", "description", "a string", Value::is_string, &mut out);
    optional_of(root, "metadata", "metadata", "an object", Value::is_object, &mut out);

    let mut node_ids: HashSet<String> = HashSet::new();
    match root.get("nodes") {
        None | Some(Value::Null) => out.push(Violation::new("nodes", "missing required field")),
        Some(Value::Array(nodes)) if nodes.is_empty() => {
            out.push(Violation::new("nodes", "must contain at least one node"))
        }
        Some(Value::Array(nodes)) => {
            for (i, node) in nodes.iter().enumerate() {
                let base = format!("nodes[{}]", i);
                let obj = match node.as_object() {
                    Some(obj) => obj,
                    None => {
                        out.push(Violation::new(base, "node must be an object"));
                        continue;
                    }
                };
                require_string(obj, "id", &format!("{}.id", base), &mut out);
                require_string(obj, "type", &format!("{}.type", base), &mut out);

                if let Some(id) = obj.get("id").and_then(Value::as_str) {
                    if !id.trim().is_empty() && !node_ids.insert(id.to_string()) {
                        out.push(Violation::new(
                            format!("{}.id", base),
                            format!("duplicate node id '{}'", id),
                        ));
                    }
                }

                optional_of(obj, "title", &format!("{}.title", base), "a string", Value::is_string, &mut out);
                optional_of(obj, "description", &format!("{}.description", base), "a string", Value::is_string, &mut out);
                optional_of(obj, "fallback", &format!("{}.fallback", base), "a string", Value::is_string, &mut out);
                optional_of(obj, "executor_config", &format!("{}.executor_config", base), "an object", Value::is_object, &mut out);
                optional_of(obj, "timeout", &format!("{}.timeout", base), "a non-negative integer", Value::is_u64, &mut out);
                optional_of(obj, "retry_count", &format!("{}.retry_count", base), "a non-negative integer", |v| v.as_u64().map_or(false, |n| n <= u32::MAX as u64), &mut out);
                optional_of(obj, "precondition", &format!("{}.precondition", base), "a list of strings", is_string_list, &mut out);
                optional_of(obj, "postcondition", &format!("{}.postcondition", base), "a list of strings", is_string_list, &mut out);
            }
        }
        Some(_) => out.push(Violation::new("nodes", "must be a list")),
    }

    match root.get("edges") {
        None | Some(Value::Null) => {}
        Some(Value::Array(edges)) => {
            for (i, edge) in edges.iter().enumerate() {
                let base = format!("edges[{}]", i);
                let obj = match edge.as_object() {
                    Some(obj) => obj,
                    None => {
                        out.push(Violation::new(base, "edge must be an object"));
                        continue;
                    }
                };
                for field in ["from_node", "to_node"] {
                    let path = format!("{}.{}", base, field);
                    require_string(obj, field, &path, &mut out);
                    if let Some(target) = obj.get(field).and_then(Value::as_str) {
                        if !target.trim().is_empty() && !node_ids.contains(target) {
                            out.push(Violation::new(path, format!("unknown node '{}'", target)));
                        }
                    }
                }
                optional_of(obj, "condition", &format!("{}.condition", base), "a string", Value::is_string, &mut out);
                optional_of(obj, "weight", &format!("{}.weight", base), "a number", Value::is_number, &mut out);
                optional_of(obj, "parallel", &format!("{}.parallel", base), "a boolean", Value::is_boolean, &mut out);
            }
        }
        Some(_) => out.push(Violation::new("edges", "must be a list")),
    }

    out
}

fn build_digraph(graph: &TaskGraph) -> (DiGraph<usize, ()>, HashMap<&str, NodeIndex>) {
    let mut dag = DiGraph::new();
    let mut indices = HashMap::new();
    for (i, node) in graph.nodes.iter().enumerate() {
        indices.insert(node.id.as_str(), dag.add_node(i));
    }
    for edge in &graph.edges {
        if let (Some(&from), Some(&to)) = (
            indices.get(edge.from_node.as_str()),
            indices.get(edge.to_node.as_str()),
        ) {
            dag.add_edge(from, to, ());
        }
    }
    (dag, indices)
}

fn has_cycle(graph: &TaskGraph) -> bool {
    let (dag, _) = build_digraph(graph);
    is_cyclic_directed(&dag)
}

/// Deterministic dispatch order: topological, ties broken by declaration order.
pub fn execution_order(graph: &TaskGraph) -> Vec<String> {
    let (dag, _) = build_digraph(graph);
    let mut in_degree: Vec<usize> = dag
        .node_indices()
        .map(|idx| dag.neighbors_directed(idx, Direction::Incoming).count())
        .collect();

    let mut ready: BTreeSet<usize> = dag
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(|idx| dag[idx])
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(position) = ready.pop_first() {
        order.push(graph.nodes[position].id.clone());
        let idx = NodeIndex::new(position);
        for next in dag.neighbors_directed(idx, Direction::Outgoing) {
            let slot = &mut in_degree[next.index()];
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                ready.insert(dag[next]);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::model::{Edge, NodeType, TaskNode};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_every_violation_reported() {
        let loader = GraphLoader::new();
        let err = loader
            .load(json!({
                "nodes": [
                    {"type": "navigation"},
                    {"id": "b"},
                    "not-a-node"
                ],
                "edges": [{"from_node": "b", "to_node": "ghost"}]
            }))
            .unwrap_err();

        let paths: Vec<_> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "graph_id",
                "goal",
                "scene",
                "nodes[0].id",
                "nodes[1].type",
                "nodes[2]",
                "edges[0].to_node"
            ]
        );
    }

    #[test]
    fn test_empty_nodes_rejected() {
        let err = GraphLoader::new()
            .load(json!({"graph_id": "g", "goal": "x", "scene": "s", "nodes": []}))
            .unwrap_err();
        assert_eq!(err.violations()[0].path, "nodes");
    }

    #[test]
    fn test_cycle_rejected() {
        let err = GraphLoader::new()
            .load(json!({
                "graph_id": "loop", "goal": "x", "scene": "s",
                "nodes": [{"id": "a", "type": "decision"}, {"id": "b", "type": "decision"}],
                "edges": [{"from_node": "a", "to_node": "b"}, {"from_node": "b", "to_node": "a"}]
            }))
            .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_yaml_source() {
        let yaml = r#"
graph_id: restroom
scene: mall
goal: find a restroom
nodes:
  - id: locate
    type: observation
  - id: walk
    type: navigation
    timeout: 30
edges:
  - from_node: locate
    to_node: walk
"#;
        let graph = GraphLoader::new().load_str(yaml, GraphFormat::Yaml).unwrap();
        assert_eq!(graph.nodes[1].timeout, Some(30));
        assert_eq!(graph.nodes[0].node_type, NodeType::Observation);
    }

    #[test]
    fn test_execution_order_respects_edges_and_declaration() {
        let graph = TaskGraph::new("g", "s", "goal")
            .with_node(TaskNode::new("c", NodeType::Interaction))
            .with_node(TaskNode::new("a", NodeType::SceneEntry))
            .with_node(TaskNode::new("b", NodeType::Navigation))
            .with_node(TaskNode::new("d", NodeType::Decision))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"));
        assert_eq!(execution_order(&graph), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_save_then_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        let loader = GraphLoader::with_base_dir(dir.path());
        let graph = TaskGraph::new("g1", "hospital", "visit")
            .with_node(TaskNode::new("enter", NodeType::SceneEntry))
            .with_node(TaskNode::new("go", NodeType::Navigation))
            .sequential();

        loader.save(&graph, "g1.json").unwrap();
        loader.save(&graph, "g1_copy.yaml").unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let graphs = loader.load_dir(".").unwrap();
        assert_eq!(graphs.len(), 2);
        assert!(graphs.iter().all(|g| g == &graph));
    }

    fn fully_specified() -> TaskGraph {
        let mut ask = TaskNode::new("ask", NodeType::Interaction)
            .with_title("Ask for directions")
            .with_config("prompt", json!("Which way to radiology?"))
            .with_config("voice", json!({"rate": 1.1, "lang": "en"}))
            .with_timeout(45)
            .with_fallback("decision");
        ask.description = Some("Speak to the nearest staff member".into());
        ask.input_schema = json!({"type": "object", "properties": {"scene": {"type": "string"}}});
        ask.output_schema = json!({"type": "object", "required": ["response"]});
        ask.precondition = vec!["staff_nearby".into()];
        ask.postcondition = vec!["direction_known".into(), "user_informed".into()];
        ask.retry_count = 2;

        let mut elevator = Edge::new("ask", "elevator").when("response == elevator");
        elevator.weight = Some(0.75);
        elevator.parallel = Some(false);
        let mut stairs = Edge::new("ask", "stairs").when("response == stairs");
        stairs.weight = Some(0.25);
        stairs.parallel = Some(true);

        let mut graph = TaskGraph::new("radiology", "hospital", "reach radiology")
            .with_node(ask)
            .with_node(TaskNode::new("elevator", NodeType::Navigation).with_timeout(120))
            .with_node(TaskNode::new("stairs", NodeType::Navigation))
            .with_edge(elevator)
            .with_edge(stairs);
        graph.name = Some("Radiology visit".into());
        graph.description = Some("From the main entrance to radiology".into());
        graph.metadata = json!({"author": "clinic", "version": 3, "tags": ["indoor", "floor_2"]})
            .as_object()
            .cloned()
            .unwrap();
        graph
    }

    #[test]
    fn test_every_field_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let loader = GraphLoader::with_base_dir(dir.path());
        let graph = fully_specified();

        for file in ["radiology.json", "radiology.yaml"] {
            let path = loader.save(&graph, file).unwrap();
            let loaded = loader.load(path).unwrap();
            assert_eq!(loaded, graph, "round trip through {}", file);
        }
    }
}
