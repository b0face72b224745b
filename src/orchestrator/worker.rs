//! Per-task worker: dispatches one node at a time in edge order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::executor::{NodeContext, RuntimeEvent};
use crate::graph::{condition_holds, execution_order, TaskGraph, TaskNode};
use crate::state::{GraphStatus, NodeStatus, StateManager, TaskState};

use super::Inner;

/// Control requests observed at node boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Hold,
    Stop,
}

/// Re-check interval while the task is paused for an insertion
const PAUSED_POLL: Duration = Duration::from_millis(50);

pub(crate) enum Step<'a> {
    Run(&'a TaskNode),
    Skip(&'a TaskNode),
    Finished,
}

/// First pending node in dispatch order, or `Skip` when none of its
/// incoming edges is satisfied.
pub(crate) fn next_step<'a>(graph: &'a TaskGraph, order: &[String], state: &TaskState) -> Step<'a> {
    for node_id in order {
        let pending = state
            .node(node_id)
            .map_or(false, |n| n.status == NodeStatus::Pending);
        if !pending {
            continue;
        }
        let Some(node) = graph.node(node_id) else {
            continue;
        };

        let mut incoming = graph.incoming(node_id).peekable();
        if incoming.peek().is_none() {
            return Step::Run(node);
        }
        let satisfied = incoming.any(|edge| {
            let Some(source) = state.node(&edge.from_node) else {
                return false;
            };
            let succeeded = match source.status {
                NodeStatus::Complete => true,
                NodeStatus::Failed => false,
                _ => return false,
            };
            let output = Value::Object(source.output.clone());
            condition_holds(edge.condition.as_deref().unwrap_or(""), succeeded, &output)
        });
        return if satisfied {
            Step::Run(node)
        } else {
            Step::Skip(node)
        };
    }
    Step::Finished
}

pub(crate) async fn run_worker(
    inner: Arc<Inner>,
    task_id: String,
    graph: Arc<TaskGraph>,
    mut control: watch::Receiver<RunSignal>,
) {
    let order = execution_order(&graph);
    info!(task_id = %task_id, nodes = order.len(), "Worker started");

    loop {
        let signal = *control.borrow_and_update();
        match signal {
            RunSignal::Stop => break,
            RunSignal::Hold => {
                if control.changed().await.is_err() {
                    break;
                }
                continue;
            }
            RunSignal::Run => {}
        }

        let Some(state) = inner.state.get_state(&task_id) else {
            break;
        };
        if state.graph_status.is_terminal() {
            inner.on_terminal(&task_id).await;
            break;
        }
        if state.graph_status == GraphStatus::Paused {
            let _ = tokio::time::timeout(PAUSED_POLL, control.changed()).await;
            continue;
        }

        match next_step(&graph, &order, &state) {
            Step::Finished => {
                finish(&inner, &task_id).await;
                break;
            }
            Step::Skip(node) => {
                debug!(task_id = %task_id, node_id = %node.id, "No incoming edge satisfied, skipping");
                inner.events.emit(
                    &task_id,
                    RuntimeEvent::NodeSkipped {
                        node_id: node.id.clone(),
                    },
                );
                let status =
                    inner
                        .state
                        .update_node_status(&task_id, &node.id, NodeStatus::Skipped, None);
                if settle(&inner, &task_id, status).await {
                    break;
                }
            }
            Step::Run(node) => {
                let status = match dispatch(&inner, &task_id, &graph, node, &state).await {
                    Ok(Some(status)) => Ok(status),
                    Ok(None) => {
                        debug!(task_id = %task_id, node_id = %node.id, "Paused before dispatch, holding");
                        continue;
                    }
                    Err(e) => Err(e),
                };
                if settle(&inner, &task_id, status).await {
                    break;
                }
            }
        }
    }
    debug!(task_id = %task_id, "Worker exited");
}

/// Run one node. `None` when the task was paused before the node could start.
async fn dispatch(
    inner: &Inner,
    task_id: &str,
    graph: &TaskGraph,
    node: &TaskNode,
    state: &TaskState,
) -> crate::Result<Option<GraphStatus>> {
    if !inner.state.start_node(task_id, &node.id)? {
        return Ok(None);
    }

    let ctx = NodeContext::new(task_id, &graph.graph_id, &graph.scene, &node.id)
        .with_context(state.context.clone());
    let result = inner.executor.execute(node, &ctx).await;
    let output = result.recorded_output();

    inner
        .cache
        .set(format!("{}.{}", task_id, node.id), output.clone(), None);
    inner
        .state
        .append_context(task_id, "execution_path", Value::String(node.id.clone()))?;

    let status = if result.success {
        NodeStatus::Complete
    } else {
        NodeStatus::Failed
    };
    inner
        .state
        .update_node_status(task_id, &node.id, status, Some(output))
        .map(Some)
}

/// Handle the outcome of a node update; `true` when the worker should exit.
async fn settle(inner: &Arc<Inner>, task_id: &str, status: crate::Result<GraphStatus>) -> bool {
    match status {
        Ok(status) if status.is_terminal() => {
            inner.on_terminal(task_id).await;
            true
        }
        Ok(_) => false,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Worker could not record node result");
            true
        }
    }
}

/// Nothing left to dispatch: close the task if the state has not already.
async fn finish(inner: &Arc<Inner>, task_id: &str) {
    if let Some(status) = inner.state.graph_status(task_id) {
        if !status.is_terminal() && all_done(&inner.state, task_id) {
            if let Err(e) = inner.state.set_task_status(task_id, GraphStatus::Complete) {
                error!(task_id = %task_id, error = %e, "Could not complete task");
                return;
            }
        }
    }
    inner.on_terminal(task_id).await;
}

fn all_done(state: &StateManager, task_id: &str) -> bool {
    state
        .get_state(task_id)
        .map_or(false, |s| s.nodes.iter().all(|n| n.status.is_done()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, NodeType};
    use serde_json::json;

    fn branching() -> TaskGraph {
        TaskGraph::new("g", "hospital", "see a doctor")
            .with_node(TaskNode::new("ask", NodeType::Interaction))
            .with_node(TaskNode::new("elevator", NodeType::Navigation))
            .with_node(TaskNode::new("stairs", NodeType::Navigation))
            .with_edge(Edge::new("ask", "elevator").when("response == elevator"))
            .with_edge(Edge::new("ask", "stairs").when("response == stairs"))
    }

    #[test]
    fn test_next_step_follows_conditions() {
        let graph = branching();
        let order = execution_order(&graph);
        let mut state = TaskState::new("g", &graph.node_ids());
        assert!(matches!(next_step(&graph, &order, &state), Step::Run(n) if n.id == "ask"));

        state.nodes[0].status = NodeStatus::Complete;
        state.nodes[0].output = crate::state::output_map(json!({"response": "stairs"}));
        assert!(matches!(next_step(&graph, &order, &state), Step::Skip(n) if n.id == "elevator"));

        state.nodes[1].status = NodeStatus::Skipped;
        assert!(matches!(next_step(&graph, &order, &state), Step::Run(n) if n.id == "stairs"));

        state.nodes[2].status = NodeStatus::Complete;
        assert!(matches!(next_step(&graph, &order, &state), Step::Finished));
    }
}
