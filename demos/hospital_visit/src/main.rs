use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use badge_orchestrator::executor::{FnHandler, LoggingEventSink, NodeOutput};
use badge_orchestrator::{EngineConfig, NodeType, Orchestrator, TaskGraph, TaskNode};
use serde_json::json;
use tracing::info;

fn graph_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("graphs/hospital_visit.json")
}

fn restroom_detour() -> TaskGraph {
    TaskGraph::new("restroom", "hospital", "find the nearest restroom")
        .with_node(TaskNode::new("ask_staff", NodeType::Interaction))
        .with_node(TaskNode::new("walk_there", NodeType::Navigation))
        .sequential()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let storage = std::env::temp_dir().join("hospital_visit_demo");
    let config = EngineConfig::builder()
        .storage_path(&storage)
        .grace_delay(Duration::from_secs(2))
        .build()?;

    let orchestrator = Orchestrator::builder(config)
        .handler(Arc::new(FnHandler::new(NodeType::SceneEntry, |_, ctx| async move {
            Ok(NodeOutput::success(json!({ "scene": ctx.scene })))
        })))
        .handler(Arc::new(FnHandler::new(NodeType::Interaction, |config, ctx| async move {
            info!(task_id = %ctx.task_id, prompt = ?config.get("prompt"), "Asking a bystander");
            Ok(NodeOutput::success(json!({ "response": "elevator" })))
        })))
        .handler(Arc::new(FnHandler::new(NodeType::Navigation, |config, _| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(NodeOutput::success(json!({ "arrived_at": config.get("target") })))
        })))
        .handler(Arc::new(FnHandler::new(NodeType::Observation, |_, _| async {
            Ok(NodeOutput::success(json!({ "sign": "Outpatient clinic 2" })))
        })))
        .event_sink(Arc::new(LoggingEventSink))
        .build()
        .await?;

    if let Some(outcome) = orchestrator.recovery_outcome() {
        info!(?outcome, "Startup recovery");
    }

    let graph = orchestrator.load_graph(graph_path())?;
    let task_id = orchestrator.register(graph).await?;
    orchestrator.start(&task_id).await?;

    // the wearer asks for a restroom on the way
    tokio::time::sleep(Duration::from_millis(200)).await;
    let detour = orchestrator.insert(&task_id, restroom_detour(), None).await?;
    let detour_state = orchestrator.wait_for(&detour, Duration::from_secs(30)).await?;
    info!(status = %detour_state.graph_status, "Detour finished");

    let state = orchestrator.wait_for(&task_id, Duration::from_secs(60)).await?;
    if let Some(summary) = orchestrator.summary(&task_id) {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    println!(
        "execution path: {}",
        state.context.get("execution_path").cloned().unwrap_or_default()
    );
    println!("reports waiting for upload: {}", orchestrator.pending_reports()?);

    orchestrator.shutdown().await;
    Ok(())
}
