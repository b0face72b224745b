use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::core::ExecutorConfig;
use crate::graph::{NodeType, TaskNode};

use super::events::{EventEmitter, RuntimeEvent};
use super::handler::{HandlerRegistry, NodeContext, NodeHandler, NodeOutput};
use super::stubs::stub_output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Complete,
    Failed,
    /// No collaborator registered for the node type; output is the degradation stub
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    UnknownNodeType,
    Execution,
    Timeout,
    /// The collaborator ran and answered `success: false`
    Reported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Record of a fallback attempt. Never changes the node's own status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub action: String,
    pub executed: bool,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub node_id: String,
    pub node_type: NodeType,
    pub status: ResultStatus,
    pub success: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub output: Option<Value>,
    pub error: Option<NodeError>,
    pub fallback: Option<FallbackOutcome>,
    /// Advisory `output_schema` mismatches
    pub schema_violations: Vec<String>,
    pub metadata: Option<Value>,
}

impl NodeResult {
    pub fn is_unavailable(&self) -> bool {
        self.status == ResultStatus::Unavailable
    }

    /// The output as it is stored on the node state, with failure details folded in
    pub fn recorded_output(&self) -> Value {
        let mut map = match &self.output {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        if let Some(error) = &self.error {
            map.insert("error".to_string(), json!(error));
        }
        if let Some(fallback) = &self.fallback {
            map.insert("fallback".to_string(), json!(fallback));
        }
        if !self.schema_violations.is_empty() {
            map.insert("schema_violations".to_string(), json!(self.schema_violations));
        }
        Value::Object(map)
    }
}

/// Dispatches a node to the handler registered for its type
pub struct NodeExecutor {
    registry: HandlerRegistry,
    fallbacks: RwLock<HashMap<String, Arc<dyn NodeHandler>>>,
    config: ExecutorConfig,
    events: Arc<EventEmitter>,
}

impl NodeExecutor {
    pub fn new(registry: HandlerRegistry, config: ExecutorConfig) -> Self {
        Self {
            registry,
            fallbacks: RwLock::new(HashMap::new()),
            config,
            events: Arc::new(EventEmitter::disabled()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = events;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register the handler that runs when a failed node names `action` as its fallback
    pub fn register_fallback(&self, action: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.fallbacks.write().insert(action.into(), handler);
    }

    pub async fn execute(&self, node: &TaskNode, ctx: &NodeContext) -> NodeResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        let type_name = node.node_type.to_string();

        self.events.emit(
            &ctx.task_id,
            RuntimeEvent::NodeStarted {
                node_id: node.id.clone(),
                node_type: type_name.clone(),
            },
        );

        let mut result = NodeResult {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            status: ResultStatus::Failed,
            success: false,
            duration: Duration::ZERO,
            timestamp,
            output: None,
            error: None,
            fallback: None,
            schema_violations: Vec::new(),
            metadata: None,
        };

        if !node.node_type.is_known() {
            result.error = Some(NodeError::new(
                NodeErrorKind::UnknownNodeType,
                format!("unknown node type '{}'", type_name),
            ));
        } else if let Some(handler) = self.registry.get(&node.node_type) {
            self.run_handler(handler, node, ctx, &mut result).await;
        } else if self.config.strict_collaborators {
            result.error = Some(NodeError::new(
                NodeErrorKind::Execution,
                format!("no collaborator registered for '{}'", type_name),
            ));
        } else {
            debug!(node_id = %node.id, node_type = %type_name, "No collaborator, using stub output");
            result.status = ResultStatus::Unavailable;
            result.success = true;
            result.output = stub_output(&node.node_type, &node.executor_config);
        }

        if result.status == ResultStatus::Failed {
            if let Some(action) = &node.fallback {
                result.fallback = Some(self.run_fallback(action, node, ctx).await);
            }
        }

        result.duration = started.elapsed();
        self.publish(ctx, &result);
        result
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn NodeHandler>,
        node: &TaskNode,
        ctx: &NodeContext,
        result: &mut NodeResult,
    ) {
        let limit = node
            .timeout_duration()
            .unwrap_or(self.config.default_node_timeout);

        match tokio::time::timeout(limit, handler.handle(&node.executor_config, ctx)).await {
            Ok(Ok(output)) => {
                let NodeOutput {
                    outputs,
                    success,
                    metadata,
                } = output;
                result.metadata = metadata;
                if let Some(outputs) = &outputs {
                    result.schema_violations = schema_violations(&node.output_schema, outputs);
                    if !result.schema_violations.is_empty() {
                        warn!(
                            task_id = %ctx.task_id,
                            node_id = %node.id,
                            violations = ?result.schema_violations,
                            "Node output does not match output_schema"
                        );
                    }
                }
                result.output = outputs;
                if success {
                    result.status = ResultStatus::Complete;
                    result.success = true;
                } else {
                    result.error = Some(NodeError::new(
                        NodeErrorKind::Reported,
                        "collaborator reported failure",
                    ));
                }
            }
            Ok(Err(e)) => {
                result.error = Some(NodeError::new(NodeErrorKind::Execution, e.to_string()));
            }
            Err(_) => {
                result.error = Some(NodeError::new(
                    NodeErrorKind::Timeout,
                    format!("handler exceeded {}ms", limit.as_millis()),
                ));
            }
        }
    }

    async fn run_fallback(&self, action: &str, node: &TaskNode, ctx: &NodeContext) -> FallbackOutcome {
        info!(task_id = %ctx.task_id, node_id = %node.id, fallback = %action, "Running fallback");
        let handler = self.fallbacks.read().get(action).cloned();
        let Some(handler) = handler else {
            return FallbackOutcome {
                action: action.to_string(),
                executed: true,
                success: true,
                output: Some(json!({ "message": format!("fallback '{}' acknowledged", action) })),
                error: None,
            };
        };

        let limit = node
            .timeout_duration()
            .unwrap_or(self.config.default_node_timeout);
        match tokio::time::timeout(limit, handler.handle(&node.executor_config, ctx)).await {
            Ok(Ok(output)) => FallbackOutcome {
                action: action.to_string(),
                executed: true,
                success: output.success,
                output: output.outputs,
                error: None,
            },
            Ok(Err(e)) => FallbackOutcome {
                action: action.to_string(),
                executed: false,
                success: false,
                output: None,
                error: Some(e.to_string()),
            },
            Err(_) => FallbackOutcome {
                action: action.to_string(),
                executed: false,
                success: false,
                output: None,
                error: Some(format!("fallback exceeded {}ms", limit.as_millis())),
            },
        }
    }

    fn publish(&self, ctx: &NodeContext, result: &NodeResult) {
        let node_type = result.node_type.to_string();
        match (&result.status, &result.error) {
            (ResultStatus::Failed, error) => {
                let message = error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                warn!(
                    task_id = %ctx.task_id,
                    node_id = %result.node_id,
                    error = %message,
                    "Node failed"
                );
                self.events.emit(
                    &ctx.task_id,
                    RuntimeEvent::NodeFailed {
                        node_id: result.node_id.clone(),
                        node_type,
                        error: message,
                        fallback_ran: result.fallback.as_ref().map_or(false, |f| f.executed),
                    },
                );
            }
            (status, _) => {
                info!(
                    task_id = %ctx.task_id,
                    node_id = %result.node_id,
                    duration_ms = result.duration.as_millis() as u64,
                    "Node complete"
                );
                self.events.emit(
                    &ctx.task_id,
                    RuntimeEvent::NodeComplete {
                        node_id: result.node_id.clone(),
                        node_type,
                        unavailable: *status == ResultStatus::Unavailable,
                        duration_ms: result.duration.as_millis() as u64,
                    },
                );
            }
        }
    }
}

/// Validate `output` against a non-null schema, returning readable violations
fn schema_violations(schema: &Value, output: &Value) -> Vec<String> {
    if schema.is_null() {
        return Vec::new();
    }
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator
            .iter_errors(output)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect(),
        Err(e) => vec![format!("invalid output_schema: {}", e)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::events::BufferingEventSink;
    use crate::executor::handler::FnHandler;

    fn executor(strict: bool) -> (NodeExecutor, BufferingEventSink) {
        let sink = BufferingEventSink::new();
        let config = ExecutorConfig {
            default_node_timeout: Duration::from_secs(5),
            strict_collaborators: strict,
        };
        let exec = NodeExecutor::new(HandlerRegistry::new(), config)
            .with_events(Arc::new(EventEmitter::new(Some(Arc::new(sink.clone())))));
        (exec, sink)
    }

    fn ctx(node_id: &str) -> NodeContext {
        NodeContext::new("task", "graph", "hospital", node_id)
    }

    #[tokio::test]
    async fn test_missing_collaborator_is_unavailable() {
        let (exec, sink) = executor(false);
        let node = TaskNode::new("go", NodeType::Navigation)
            .with_config("destination", json!("registration desk"));

        let result = exec.execute(&node, &ctx("go")).await;
        assert_eq!(result.status, ResultStatus::Unavailable);
        assert!(result.success);
        let output = result.output.unwrap();
        assert_eq!(output["unavailable"], json!(true));
        assert_eq!(output["destination"], json!("registration desk"));
        assert_eq!(sink.names_for("task"), vec!["node_started", "node_complete"]);
    }

    #[tokio::test]
    async fn test_strict_mode_fails_missing_collaborator() {
        let (exec, _) = executor(true);
        let node = TaskNode::new("go", NodeType::Navigation);
        let result = exec.execute(&node, &ctx("go")).await;
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::Execution);
    }

    #[tokio::test]
    async fn test_unknown_type_fails() {
        let (exec, sink) = executor(false);
        let node = TaskNode::new("x", NodeType::Unknown("teleport".into()));
        let result = exec.execute(&node, &ctx("x")).await;
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::UnknownNodeType);
        assert_eq!(sink.names_for("task"), vec!["node_started", "node_failed"]);
    }

    #[tokio::test]
    async fn test_reported_failure_runs_fallback_without_recovering() {
        let (exec, _) = executor(false);
        exec.registry().register(Arc::new(FnHandler::new(
            NodeType::Interaction,
            |_, _| async { Ok(NodeOutput::failure(json!({"response": null}))) },
        )));
        exec.register_fallback(
            "repeat_question",
            Arc::new(FnHandler::new(NodeType::Interaction, |_, _| async {
                Ok(NodeOutput::success(json!({"response": "yes"})))
            })),
        );

        let node = TaskNode::new("ask", NodeType::Interaction).with_fallback("repeat_question");
        let result = exec.execute(&node, &ctx("ask")).await;

        assert_eq!(result.status, ResultStatus::Failed);
        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, NodeErrorKind::Reported);
        let fallback = result.fallback.as_ref().unwrap();
        assert!(fallback.executed && fallback.success);
        assert_eq!(result.recorded_output()["fallback"]["action"], json!("repeat_question"));
    }

    #[tokio::test]
    async fn test_failing_fallback_is_contained() {
        let (exec, _) = executor(false);
        exec.registry().register(Arc::new(FnHandler::new(NodeType::ExternalCall, |_, _| async {
            Err(anyhow::anyhow!("hospital api unreachable"))
        })));
        exec.register_fallback(
            "call_again",
            Arc::new(FnHandler::new(NodeType::ExternalCall, |_, _| async {
                Err(anyhow::anyhow!("still unreachable"))
            })),
        );

        let node = TaskNode::new("book", NodeType::ExternalCall).with_fallback("call_again");
        let result = exec.execute(&node, &ctx("book")).await;
        assert_eq!(result.error.as_ref().unwrap().kind, NodeErrorKind::Execution);
        assert_eq!(
            result.fallback.unwrap().error.as_deref(),
            Some("still unreachable")
        );
    }

    #[tokio::test]
    async fn test_timeout_fails_node() {
        let (exec, _) = executor(false);
        exec.registry().register(Arc::new(FnHandler::new(NodeType::Observation, |_, _| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(NodeOutput::success_empty())
        })));

        let node = TaskNode::new("look", NodeType::Observation).with_timeout(1);
        let result = exec.execute(&node, &ctx("look")).await;
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::Timeout);
        assert!(result.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_advisory() {
        let (exec, _) = executor(false);
        exec.registry().register(Arc::new(FnHandler::new(NodeType::Decision, |_, _| async {
            Ok(NodeOutput::success(json!({"selected": 7})))
        })));

        let mut node = TaskNode::new("pick", NodeType::Decision);
        node.output_schema = json!({
            "type": "object",
            "properties": {"selected": {"type": "string"}},
            "required": ["selected"]
        });
        let result = exec.execute(&node, &ctx("pick")).await;
        assert_eq!(result.status, ResultStatus::Complete);
        assert_eq!(result.schema_violations.len(), 1);
        assert!(result.schema_violations[0].starts_with("/selected"));
    }
}
