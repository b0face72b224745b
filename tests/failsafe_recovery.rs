//! Failsafe on a hung collaborator, then recovery on the next start

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use badge_orchestrator::executor::{FnHandler, NodeHandler, NodeOutput};
use badge_orchestrator::failsafe::FixedAnswer;
use badge_orchestrator::storage::EngineStore;
use badge_orchestrator::{
    GraphStatus, NodeStatus, NodeType, Orchestrator, RecoveryOutcome, TaskGraph, TaskNode,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::Notify;

use common::{answering, config, counting};

const WAIT: Duration = Duration::from_secs(5);

fn visit() -> TaskGraph {
    TaskGraph::new("clinic", "hospital", "reach the clinic")
        .with_node(TaskNode::new("enter", NodeType::SceneEntry))
        .with_node(TaskNode::new("walk", NodeType::Navigation))
        .with_node(TaskNode::new("check_in", NodeType::Interaction))
        .sequential()
}

/// Navigation that never answers within the test
fn hung_walk(started: Arc<Notify>) -> Arc<dyn NodeHandler> {
    Arc::new(FnHandler::new(NodeType::Navigation, move |_, _| {
        let started = started.clone();
        async move {
            started.notify_one();
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(NodeOutput::success_empty())
        }
    }))
}

/// Run the visit until `walk` hangs, then declare the failsafe
async fn crash_during_walk(store: EngineStore, dir: &std::path::Path) {
    let started = Arc::new(Notify::new());
    let orchestrator = Orchestrator::builder(config(dir))
        .store(store)
        .handler(answering(NodeType::SceneEntry, json!({"scene": "hospital"})))
        .handler(hung_walk(started.clone()))
        .build()
        .await
        .unwrap();

    let task_id = orchestrator.register(visit()).await.unwrap();
    orchestrator.start(&task_id).await.unwrap();
    started.notified().await;

    orchestrator.trigger_failsafe("navigation stopped responding", Some("navigation"));
    let status = orchestrator.recovery_status();
    assert!(status.failsafe_mode);
    assert!(status.has_recovery);
    let record = status.record.unwrap();
    assert_eq!(record.active_task_id.as_deref(), Some("clinic"));
    assert_eq!(record.last_known_node.as_deref(), Some("walk"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_recovered_task_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = EngineStore::temporary().unwrap();
    crash_during_walk(store.clone(), dir.path()).await;

    let entries = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::builder(config(dir.path()))
        .store(store)
        .handler(counting(NodeType::SceneEntry, json!({}), entries.clone()))
        .handler(answering(NodeType::Navigation, json!({"arrived": true})))
        .handler(answering(NodeType::Interaction, json!({"checked_in": true})))
        .recovery_prompt(Arc::new(FixedAnswer(true)))
        .build()
        .await
        .unwrap();

    assert_eq!(
        orchestrator.recovery_outcome(),
        Some(RecoveryOutcome::Recovered {
            task_id: "clinic".into(),
            last_node_id: Some("walk".into()),
        })
    );
    assert!(!orchestrator.recovery_status().failsafe_mode);

    let recovered = orchestrator.state("clinic").unwrap();
    assert_eq!(recovered.graph_status, GraphStatus::Pending);
    assert_eq!(recovered.node("enter").unwrap().status, NodeStatus::Complete);
    assert_eq!(recovered.node("walk").unwrap().status, NodeStatus::Pending);

    orchestrator.start("clinic").await.unwrap();
    let state = orchestrator.wait_for("clinic", WAIT).await.unwrap();
    assert_eq!(state.graph_status, GraphStatus::Complete);
    assert_eq!(entries.load(Ordering::SeqCst), 0);
    assert_eq!(
        state.context.get("execution_path"),
        Some(&json!(["enter", "walk", "check_in"]))
    );

    let events: Vec<String> = orchestrator
        .recovery_log()
        .unwrap()
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(events, vec!["user_choice", "recovery_success"]);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_declined_recovery_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let store = EngineStore::temporary().unwrap();
    crash_during_walk(store.clone(), dir.path()).await;

    let orchestrator = Orchestrator::builder(config(dir.path()))
        .store(store)
        .recovery_prompt(Arc::new(FixedAnswer(false)))
        .build()
        .await
        .unwrap();

    assert!(matches!(
        orchestrator.recovery_outcome(),
        Some(RecoveryOutcome::Reset { .. })
    ));
    assert!(orchestrator.state("clinic").is_none());
    assert!(orchestrator.list_active().await.is_empty());
    assert!(!orchestrator.recovery_status().has_recovery);

    // the freed slot accepts the same graph again
    orchestrator.register(visit()).await.unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_missed_heartbeat_triggers_failsafe() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::builder(config(dir.path()))
        .build()
        .await
        .unwrap();

    orchestrator.register_module("camera");
    orchestrator.heartbeat("camera");
    assert!(!orchestrator.recovery_status().failsafe_mode);

    let tripped = common::eventually(WAIT, || orchestrator.recovery_status().failsafe_mode).await;
    assert!(tripped);
    let record = orchestrator.recovery_status().record.unwrap();
    assert_eq!(record.module_name.as_deref(), Some("camera"));
    assert!(!record.recovery_available);
    orchestrator.shutdown().await;
}
