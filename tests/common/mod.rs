//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use badge_orchestrator::executor::{FnHandler, NodeHandler, NodeOutput};
use badge_orchestrator::{EngineConfig, NodeType, ReportTransport, Result, TaskReport};
use parking_lot::Mutex;
use serde_json::Value;

/// Development timings with the database inside `dir`
pub fn config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::development();
    config.storage_path = dir.join("engine");
    config
}

/// Handler answering `output` and counting its calls
pub fn counting(node_type: NodeType, output: Value, calls: Arc<AtomicUsize>) -> Arc<dyn NodeHandler> {
    Arc::new(FnHandler::new(node_type, move |_, _| {
        let calls = calls.clone();
        let output = output.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(NodeOutput::success(output))
        }
    }))
}

pub fn answering(node_type: NodeType, output: Value) -> Arc<dyn NodeHandler> {
    counting(node_type, output, Arc::new(AtomicUsize::new(0)))
}

/// Keeps every report it is handed
#[derive(Default)]
pub struct RecordingTransport {
    pub reports: Mutex<Vec<TaskReport>>,
}

#[async_trait]
impl ReportTransport for RecordingTransport {
    async fn send(&self, report: &TaskReport) -> Result<()> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

impl RecordingTransport {
    /// Poll until a report for `task_id` arrives
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Option<TaskReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .reports
                .lock()
                .iter()
                .find(|r| r.task_id == task_id)
                .cloned();
            if found.is_some() || tokio::time::Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
