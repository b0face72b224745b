//! Best-effort export of finished task reports.
//!
//! Reports that cannot be delivered land in a durable pending list (a sled
//! tree keyed by task id) and are retried later; nothing is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::core::ReportConfig;
use crate::graph::TaskGraph;
use crate::state::TaskState;
use crate::storage::{trees, EngineStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub user_id: String,
    pub graph_name: String,
    pub scene: String,
    pub execution_path: Vec<String>,
    pub failed_nodes: Vec<String>,
    #[serde(default)]
    pub corrections: Vec<Value>,
    /// Seconds
    pub duration: f64,
    pub status: String,
    pub progress: u8,
    pub nodes_total: usize,
    pub nodes_completed: usize,
    pub uploaded_at: DateTime<Utc>,
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

impl TaskReport {
    pub fn from_state(state: &TaskState, graph: &TaskGraph, user_id: &str) -> Self {
        let completed = state.completed_nodes();
        let execution_path =
            string_list(state.context.get("execution_path")).unwrap_or_else(|| completed.clone());
        let corrections = state
            .context
            .get("corrections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let end = state.completed_at.unwrap_or(state.updated_at);
        let duration = state
            .started_at
            .map(|start| (end - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);

        Self {
            task_id: state.task_id.clone(),
            user_id: user_id.to_string(),
            graph_name: graph.display_name().to_string(),
            scene: graph.scene.clone(),
            execution_path,
            failed_nodes: state.failed_nodes(),
            corrections,
            duration,
            status: state.graph_status.to_string(),
            progress: state.progress,
            nodes_total: state.nodes.len(),
            nodes_completed: completed.len(),
            uploaded_at: Utc::now(),
        }
    }
}

/// Where reports go
#[async_trait]
pub trait ReportTransport: Send + Sync {
    /// `false` when the device has no way to reach the backend at all
    fn is_available(&self) -> bool {
        true
    }

    async fn send(&self, report: &TaskReport) -> Result<()>;
}

/// JSON POST to a fixed endpoint
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::configuration(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ReportTransport for HttpTransport {
    async fn send(&self, report: &TaskReport) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(report)
            .send()
            .await
            .map_err(|e| EngineError::upload(&report.task_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::upload(
                &report.task_id,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }
        Ok(())
    }
}

/// Every upload counts as exhausted; reports only ever go to the pending list
pub struct NoNetworkTransport;

#[async_trait]
impl ReportTransport for NoNetworkTransport {
    fn is_available(&self) -> bool {
        false
    }

    async fn send(&self, report: &TaskReport) -> Result<()> {
        Err(EngineError::upload(&report.task_id, "no network capability"))
    }
}

pub struct ReportUploader {
    transport: Arc<dyn ReportTransport>,
    store: EngineStore,
    config: ReportConfig,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReportUploader {
    pub fn new(transport: Arc<dyn ReportTransport>, store: EngineStore, config: ReportConfig) -> Self {
        Self {
            transport,
            store,
            config,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Transport chosen from the config: HTTP when an endpoint is set
    pub fn from_config(store: EngineStore, config: ReportConfig) -> Result<Self> {
        let transport: Arc<dyn ReportTransport> = match &config.endpoint {
            Some(endpoint) => Arc::new(HttpTransport::new(endpoint.clone(), config.request_timeout)?),
            None => Arc::new(NoNetworkTransport),
        };
        Ok(Self::new(transport, store, config))
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    /// Push with bounded retries. Returns `false` when the report was parked
    /// in the pending list instead.
    pub async fn upload(&self, report: &TaskReport) -> Result<bool> {
        if self.transport.is_available() {
            let attempts = self.config.max_retries.max(1);
            for attempt in 1..=attempts {
                match self.transport.send(report).await {
                    Ok(()) => {
                        self.store.remove(trees::PENDING_REPORTS, &report.task_id)?;
                        info!(task_id = %report.task_id, attempt = attempt, "Report uploaded");
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!(
                            task_id = %report.task_id,
                            attempt = attempt,
                            max_attempts = attempts,
                            error = %e,
                            "Report upload failed"
                        );
                        if attempt < attempts {
                            tokio::time::sleep(self.backoff()).await;
                        }
                    }
                }
            }
        } else {
            debug!(task_id = %report.task_id, "No network capability, keeping report locally");
        }

        self.store
            .put_json(trees::PENDING_REPORTS, &report.task_id, report)?;
        self.store.flush()?;
        info!(task_id = %report.task_id, "Report saved to pending list");
        Ok(false)
    }

    fn backoff(&self) -> Duration {
        let base = self.config.retry_delay;
        let jitter_ms = (base.as_millis() as u64) / 10;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(fastrand::u64(0..=jitter_ms))
        }
    }

    /// Flush the pending list; returns how many were delivered.
    pub async fn retry_pending(&self) -> Result<usize> {
        let pending = self.pending_reports()?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!(count = pending.len(), "Retrying pending reports");

        let mut delivered = 0;
        for report in &pending {
            if self.upload(report).await? {
                delivered += 1;
            }
        }
        info!(delivered = delivered, total = pending.len(), "Pending report retry finished");
        Ok(delivered)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.store.len(trees::PENDING_REPORTS)
    }

    pub fn pending_reports(&self) -> Result<Vec<TaskReport>> {
        Ok(self
            .store
            .values::<TaskReport>(trees::PENDING_REPORTS)?
            .into_iter()
            .map(|(_, report)| report)
            .collect())
    }

    /// Periodically retry pending reports until [`stop`](Self::stop)
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let uploader = Arc::downgrade(self);
        let running = self.running.clone();
        let interval = self.config.retry_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let Some(uploader) = uploader.upgrade() else {
                    break;
                };
                if !uploader.transport.is_available() {
                    continue;
                }
                if let Err(e) = uploader.retry_pending().await {
                    warn!(error = %e, "Pending report retry failed");
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ReportUploader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeType, TaskNode};
    use crate::state::{GraphStatus, NodeStatus};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` sends
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        delivered: Mutex<Vec<String>>,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReportTransport for Flaky {
        async fn send(&self, report: &TaskReport) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(EngineError::upload(&report.task_id, "connection reset"));
            }
            self.delivered.lock().push(report.task_id.clone());
            Ok(())
        }
    }

    fn config() -> ReportConfig {
        ReportConfig {
            retry_delay: Duration::from_millis(1),
            ..ReportConfig::default()
        }
    }

    fn report(task_id: &str, progress: u8) -> TaskReport {
        TaskReport {
            task_id: task_id.to_string(),
            user_id: "default_user".into(),
            graph_name: "see a doctor".into(),
            scene: "hospital".into(),
            execution_path: vec!["a".into()],
            failed_nodes: vec![],
            corrections: vec![],
            duration: 1.5,
            status: "complete".into(),
            progress,
            nodes_total: 1,
            nodes_completed: 1,
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let transport = Arc::new(Flaky::new(2));
        let uploader = ReportUploader::new(transport.clone(), EngineStore::temporary().unwrap(), config());
        assert!(uploader.upload(&report("visit", 100)).await.unwrap());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(uploader.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_parks_report_deduplicated() {
        let transport = Arc::new(Flaky::new(6));
        let uploader = ReportUploader::new(transport.clone(), EngineStore::temporary().unwrap(), config());

        assert!(!uploader.upload(&report("visit", 50)).await.unwrap());
        assert!(!uploader.upload(&report("visit", 60)).await.unwrap());
        let pending = uploader.pending_reports().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].progress, 60);

        assert_eq!(uploader.retry_pending().await.unwrap(), 1);
        assert_eq!(uploader.pending_count().unwrap(), 0);
        assert_eq!(*transport.delivered.lock(), vec!["visit".to_string()]);
    }

    #[tokio::test]
    async fn test_no_network_keeps_everything() {
        let uploader = ReportUploader::new(
            Arc::new(NoNetworkTransport),
            EngineStore::temporary().unwrap(),
            config(),
        );
        assert!(!uploader.upload(&report("a", 100)).await.unwrap());
        assert!(!uploader.upload(&report("b", 100)).await.unwrap());
        assert_eq!(uploader.retry_pending().await.unwrap(), 0);
        assert_eq!(uploader.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_report_from_state() {
        let graph = TaskGraph::new("visit", "hospital", "")
            .with_node(TaskNode::new("a", NodeType::Navigation))
            .with_node(TaskNode::new("b", NodeType::Interaction))
            .with_node(TaskNode::new("c", NodeType::SceneEntry))
            .sequential();
        let mut state = TaskState::new("visit", &graph.node_ids());
        state.nodes[0].status = NodeStatus::Complete;
        state.nodes[1].status = NodeStatus::Failed;
        state.graph_status = GraphStatus::Error;
        state.progress = state.compute_progress();
        state.context.insert("execution_path".into(), json!(["a", "b"]));

        let report = TaskReport::from_state(&state, &graph, "default_user");
        assert_eq!(report.graph_name, "visit");
        assert_eq!(report.execution_path, vec!["a", "b"]);
        assert_eq!(report.failed_nodes, vec!["b"]);
        assert_eq!(report.status, "error");
        assert_eq!(report.progress, 33);
        assert_eq!(report.nodes_completed, 1);
        assert_eq!(report.nodes_total, 3);
    }
}
