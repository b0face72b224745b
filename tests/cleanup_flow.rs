//! Release of finished tasks by the background cleanup loop

mod common;

use std::sync::Arc;
use std::time::Duration;

use badge_orchestrator::executor::FnHandler;
use badge_orchestrator::{GraphStatus, NodeType, Orchestrator, TaskGraph, TaskNode};
use serde_json::json;

use common::{answering, config, eventually};

fn single(id: &str, node_type: NodeType) -> TaskGraph {
    TaskGraph::new(id, "street", "cross the road").with_node(TaskNode::new("go", node_type))
}

#[tokio::test]
async fn test_completed_task_is_released_after_grace_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cleanup.grace_delay = Duration::from_millis(600);

    let orchestrator = Orchestrator::builder(config)
        .handler(answering(NodeType::Navigation, json!({"crossed": true})))
        .build()
        .await
        .unwrap();

    let task_id = orchestrator.register(single("crossing", NodeType::Navigation)).await.unwrap();
    orchestrator.start(&task_id).await.unwrap();
    let state = orchestrator
        .wait_for(&task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(state.graph_status, GraphStatus::Complete);

    // still inspectable inside the grace delay
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.state(&task_id).is_some());
    assert!(orchestrator.list_active().await.is_empty());

    let released = eventually(Duration::from_secs(3), || orchestrator.state(&task_id).is_none()).await;
    assert!(released);
    assert_eq!(orchestrator.cache_info().total_entries, 0);

    // the id is free again
    orchestrator.register(single("crossing", NodeType::Navigation)).await.unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_failed_task_is_released_without_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cleanup.grace_delay = Duration::from_secs(60);

    let orchestrator = Orchestrator::builder(config)
        .handler(Arc::new(FnHandler::new(NodeType::Navigation, |_, _| async {
            Err(anyhow::anyhow!("traffic light unreadable"))
        })))
        .build()
        .await
        .unwrap();

    let task_id = orchestrator.register(single("crossing", NodeType::Navigation)).await.unwrap();
    orchestrator.start(&task_id).await.unwrap();

    let released = eventually(Duration::from_secs(2), || orchestrator.state(&task_id).is_none()).await;
    assert!(released);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_overrunning_task_is_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.cleanup.task_timeout = Duration::from_millis(200);

    let orchestrator = Orchestrator::builder(config)
        .handler(Arc::new(FnHandler::new(NodeType::Navigation, |_, _| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(badge_orchestrator::NodeOutput::success_empty())
        })))
        .build()
        .await
        .unwrap();

    let task_id = orchestrator.register(single("stuck", NodeType::Navigation)).await.unwrap();
    orchestrator.start(&task_id).await.unwrap();

    let cancelled = eventually(Duration::from_secs(2), || {
        orchestrator
            .state(&task_id)
            .map_or(true, |s| s.graph_status == GraphStatus::Cancelled)
    })
    .await;
    assert!(cancelled);
    orchestrator.shutdown().await;
}
