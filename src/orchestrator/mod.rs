//! The public face of the engine.
//!
//! An [`Orchestrator`] owns every component, registers task graphs, runs one
//! worker per active task and ties insertion, cleanup and reporting together.
//! Build one with [`OrchestratorBuilder`].

mod builder;
mod worker;

pub use builder::OrchestratorBuilder;
pub use worker::RunSignal;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheInfo, CacheManager};
use crate::cleanup::{CleanupTarget, TaskCleanup};
use crate::core::errors::{EngineError, Result, TaskKindLimit};
use crate::core::EngineConfig;
use crate::executor::{EventEmitter, NodeExecutor, RuntimeEvent};
use crate::failsafe::{FailsafeTrigger, HeartbeatMonitor, ModuleStatus, RecoveryStatus};
use crate::graph::{GraphLoader, GraphSource, TaskGraph};
use crate::insertion::{InsertedTaskQueue, InsertionEvent, InsertionStatus};
use crate::recovery::{RecoveryOutcome, RestartRecoveryFlow};
use crate::report::{ReportUploader, TaskReport};
use crate::state::{GraphStatus, StateManager, StateSummary, TaskState};
use crate::storage::{trees, EngineStore, LogEntry};

use worker::run_worker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Main,
    Inserted { parent_id: String },
}

struct TaskEntry {
    graph: Arc<TaskGraph>,
    kind: TaskKind,
    control: watch::Sender<RunSignal>,
    status: watch::Sender<GraphStatus>,
    worker: Option<JoinHandle<()>>,
    finalized: bool,
}

pub(crate) struct Inner {
    config: EngineConfig,
    store: EngineStore,
    loader: GraphLoader,
    pub(crate) executor: Arc<NodeExecutor>,
    pub(crate) cache: Arc<CacheManager>,
    pub(crate) state: Arc<StateManager>,
    queue: Arc<InsertedTaskQueue>,
    monitor: Arc<HeartbeatMonitor>,
    failsafe: Arc<FailsafeTrigger>,
    recovery: RestartRecoveryFlow,
    cleanup: Arc<TaskCleanup>,
    reporter: Arc<ReportUploader>,
    pub(crate) events: Arc<EventEmitter>,
    registry: Mutex<HashMap<String, TaskEntry>>,
    recovery_outcome: SyncMutex<Option<RecoveryOutcome>>,
    background: SyncMutex<Vec<JoinHandle<()>>>,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn load_graph<P: AsRef<Path>>(&self, path: P) -> Result<TaskGraph> {
        self.inner
            .loader
            .load(GraphSource::Path(path.as_ref().to_path_buf()))
    }

    /// Register a main task graph; the graph id becomes the task id.
    pub async fn register(&self, graph: TaskGraph) -> Result<String> {
        self.inner.register(graph, TaskKind::Main).await
    }

    pub async fn start(&self, task_id: &str) -> Result<()> {
        self.inner.start(task_id).await
    }

    /// Pause `task_id` for an inserted task driven from outside the engine.
    /// Returns the host's resume point.
    pub async fn pause(&self, task_id: &str, inserted_task_id: &str) -> Result<Option<String>> {
        self.inner.pause_external(task_id, inserted_task_id).await
    }

    /// End the host's active insertion early and let it continue
    pub async fn resume(&self, task_id: &str) -> Result<Option<String>> {
        self.inner.resume(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        self.inner.cancel(task_id).await
    }

    pub async fn complete(&self, task_id: &str) -> Result<()> {
        self.inner.complete(task_id).await
    }

    /// Pause `task_id`, then register and start `inserted` in front of it.
    /// Returns the inserted task id.
    pub async fn insert(
        &self,
        task_id: &str,
        inserted: TaskGraph,
        return_point: Option<&str>,
    ) -> Result<String> {
        self.inner.insert(task_id, inserted, return_point).await
    }

    /// Wait until the task reaches a terminal status
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<TaskState> {
        self.inner.wait_for(task_id, timeout).await
    }

    pub fn summary(&self, task_id: &str) -> Option<StateSummary> {
        self.inner.state.summary(task_id)
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.inner.state.get_state(task_id)
    }

    /// Registered tasks that have not reached a terminal status
    pub async fn list_active(&self) -> Vec<String> {
        self.inner.active_ids().await
    }

    pub fn heartbeat(&self, module: &str) {
        self.inner.monitor.heartbeat(module);
    }

    pub fn register_module(&self, module: &str) {
        self.inner.monitor.register(module);
    }

    pub fn module_status(&self) -> Vec<ModuleStatus> {
        self.inner.monitor.module_status()
    }

    pub fn is_inserted_task_active(&self) -> bool {
        self.inner.queue.is_active()
    }

    pub fn trigger_failsafe(&self, reason: &str, module: Option<&str>) {
        self.inner.failsafe.trigger_failsafe(reason, module);
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.inner.failsafe.recovery_status()
    }

    /// What the startup recovery flow decided, if it ran
    pub fn recovery_outcome(&self) -> Option<RecoveryOutcome> {
        self.inner.recovery_outcome.lock().clone()
    }

    pub fn recovery_log(&self) -> Result<Vec<LogEntry>> {
        self.inner.recovery.recovery_log()
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.inner.cache.info()
    }

    pub fn pending_reports(&self) -> Result<usize> {
        self.inner.reporter.pending_count()
    }

    /// Stop background loops and workers, persisting unfinished tasks
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl Inner {
    async fn register(self: &Arc<Self>, graph: TaskGraph, kind: TaskKind) -> Result<String> {
        let graph = self.loader.load(serde_json::to_value(&graph)?)?;
        let task_id = graph.graph_id.clone();

        let mut registry = self.registry.lock().await;
        if registry.contains_key(&task_id) {
            return Err(EngineError::TaskAlreadyExists { task_id });
        }
        let (limit_kind, limit) = match kind {
            TaskKind::Main => (TaskKindLimit::Main, self.config.limits.max_main_tasks),
            TaskKind::Inserted { .. } => {
                (TaskKindLimit::Inserted, self.config.limits.max_inserted_tasks)
            }
        };
        let live = registry
            .iter()
            .filter(|(_, e)| std::mem::discriminant(&e.kind) == std::mem::discriminant(&kind))
            .filter(|(id, _)| {
                self.state
                    .graph_status(id)
                    .map_or(false, |s| !s.is_terminal())
            })
            .count();
        if live >= limit {
            warn!(task_id = %task_id, kind = ?limit_kind, limit = limit, "Task limit reached");
            return Err(EngineError::TaskLimit {
                kind: limit_kind,
                limit,
            });
        }

        self.store.put_json(trees::GRAPHS, &task_id, &graph)?;
        self.state.init(&task_id, &graph.node_ids());
        registry.insert(task_id.clone(), Self::entry(graph, kind));
        info!(task_id = %task_id, "Registered task");
        Ok(task_id)
    }

    fn entry(graph: TaskGraph, kind: TaskKind) -> TaskEntry {
        let (control, _) = watch::channel(RunSignal::Hold);
        let (status, _) = watch::channel(GraphStatus::Pending);
        TaskEntry {
            graph: Arc::new(graph),
            kind,
            control,
            status,
            worker: None,
            finalized: false,
        }
    }

    /// Put a recovered task back in the registry, ready to be started again
    async fn adopt_recovered(&self, task_id: &str) -> Result<()> {
        let graph: TaskGraph = self
            .store
            .get_json(trees::GRAPHS, task_id)?
            .ok_or_else(|| EngineError::recovery(format!("graph for {} missing", task_id)))?;
        self.state.prepare_for_recovery(task_id)?;
        self.registry
            .lock()
            .await
            .insert(task_id.to_string(), Self::entry(graph, TaskKind::Main));
        info!(task_id = task_id, "Recovered task re-registered");
        Ok(())
    }

    async fn start(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let entry = registry
            .get_mut(task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        self.state.mark_started(task_id)?;
        let _ = entry.status.send(GraphStatus::Running);

        if entry.worker.as_ref().map_or(true, |w| w.is_finished()) {
            let control = entry.control.subscribe();
            entry.worker = Some(tokio::spawn(run_worker(
                self.clone(),
                task_id.to_string(),
                entry.graph.clone(),
                control,
            )));
        }
        let _ = entry.control.send(RunSignal::Run);
        self.events.emit(
            task_id,
            RuntimeEvent::TaskStatusChanged {
                status: GraphStatus::Running.to_string(),
                progress: self.state.summary(task_id).map_or(0, |s| s.progress),
            },
        );
        info!(task_id = task_id, "Task started");
        Ok(())
    }

    async fn signal(&self, task_id: &str, signal: RunSignal) {
        if let Some(entry) = self.registry.lock().await.get(task_id) {
            let _ = entry.control.send(signal);
        }
    }

    /// Register the insertion, hold the host and protect its cache keys
    async fn begin_insertion(
        &self,
        task_id: &str,
        inserted_id: &str,
        return_point: Option<&str>,
    ) -> Result<Option<String>> {
        let resume_point = self
            .queue
            .register(task_id, inserted_id, return_point, None)?;
        self.signal(task_id, RunSignal::Hold).await;
        if self.config.insertion.snapshot_host_cache {
            let saved = self.cache.snapshot(inserted_id, Some(&format!("{}.", task_id)));
            debug!(task_id = task_id, inserted_id = inserted_id, entries = saved, "Snapshot host cache");
        }
        self.events.emit(
            task_id,
            RuntimeEvent::InsertionStarted {
                inserted_task_id: inserted_id.to_string(),
                resume_node_id: resume_point.clone(),
            },
        );
        Ok(resume_point)
    }

    async fn pause_external(&self, task_id: &str, inserted_id: &str) -> Result<Option<String>> {
        if !self.registry.lock().await.contains_key(task_id) {
            return Err(EngineError::task_not_found(task_id));
        }
        self.begin_insertion(task_id, inserted_id, None).await
    }

    async fn insert(
        self: &Arc<Self>,
        task_id: &str,
        inserted: TaskGraph,
        return_point: Option<&str>,
    ) -> Result<String> {
        let inserted_id = inserted.graph_id.clone();
        {
            let registry = self.registry.lock().await;
            if !registry.contains_key(task_id) {
                return Err(EngineError::task_not_found(task_id));
            }
            if registry.contains_key(&inserted_id) {
                return Err(EngineError::TaskAlreadyExists {
                    task_id: inserted_id,
                });
            }
        }

        self.begin_insertion(task_id, &inserted_id, return_point).await?;

        let kind = TaskKind::Inserted {
            parent_id: task_id.to_string(),
        };
        let started = match self.register(inserted, kind).await {
            Ok(id) => self.start(&id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            warn!(task_id = task_id, inserted_id = %inserted_id, error = %e, "Insertion failed, resuming host");
            self.queue.cancel(&inserted_id)?;
            return Err(e);
        }
        Ok(inserted_id)
    }

    async fn resume(&self, task_id: &str) -> Result<Option<String>> {
        if !self.registry.lock().await.contains_key(task_id) {
            return Err(EngineError::task_not_found(task_id));
        }
        match self.queue.active_entry() {
            Some(entry) if entry.parent_id == task_id => self.queue.cancel(&entry.inserted_id),
            _ => {
                debug!(task_id = task_id, "Resume requested without an active insertion");
                Ok(None)
            }
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        if !self.registry.lock().await.contains_key(task_id) {
            return Err(EngineError::task_not_found(task_id));
        }
        self.state.set_task_status(task_id, GraphStatus::Cancelled)?;
        self.signal(task_id, RunSignal::Stop).await;
        if let Some(entry) = self.queue.active_entry() {
            if entry.parent_id == task_id {
                self.queue.cancel(&entry.inserted_id)?;
            }
        }
        self.on_terminal(task_id).await;
        Ok(())
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        if !self.registry.lock().await.contains_key(task_id) {
            // an externally driven inserted task finishing
            if self.queue.active_inserted_id().as_deref() == Some(task_id) {
                self.queue.complete(task_id)?;
                return Ok(());
            }
            return Err(EngineError::task_not_found(task_id));
        }
        if let Some(entry) = self.queue.active_entry() {
            if entry.parent_id == task_id {
                self.queue.cancel(&entry.inserted_id)?;
            }
        }
        self.state.set_task_status(task_id, GraphStatus::Complete)?;
        self.signal(task_id, RunSignal::Stop).await;
        self.on_terminal(task_id).await;
        Ok(())
    }

    /// Runs once per task on its first terminal status: report, resume the
    /// host of an inserted task, schedule cleanup.
    pub(crate) async fn on_terminal(&self, task_id: &str) {
        let Some(state) = self.state.get_state(task_id) else {
            return;
        };
        if !state.graph_status.is_terminal() {
            return;
        }

        let (graph, kind) = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.get_mut(task_id) else {
                return;
            };
            if entry.finalized {
                return;
            }
            entry.finalized = true;
            let _ = entry.control.send(RunSignal::Stop);
            let _ = entry.status.send(state.graph_status);
            (entry.graph.clone(), entry.kind.clone())
        };

        info!(
            task_id = task_id,
            status = %state.graph_status,
            progress = state.progress,
            "Task finished"
        );
        self.events.emit(
            task_id,
            RuntimeEvent::TaskStatusChanged {
                status: state.graph_status.to_string(),
                progress: state.progress,
            },
        );

        if let TaskKind::Inserted { parent_id } = &kind {
            if self.queue.active_inserted_id().as_deref() == Some(task_id) {
                let resumed = if state.graph_status == GraphStatus::Complete {
                    self.queue.complete(task_id)
                } else {
                    self.queue.cancel(task_id)
                };
                if let Err(e) = resumed {
                    error!(task_id = task_id, parent_id = %parent_id, error = %e, "Could not resume host task");
                }
            }
        }

        self.cleanup
            .schedule(task_id, state.graph_status != GraphStatus::Complete);

        let report = TaskReport::from_state(&state, &graph, self.reporter.user_id());
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.upload(&report).await {
                error!(task_id = %report.task_id, error = %e, "Report could not be stored");
            }
        });
    }

    /// Wake the host once its insertion has ended
    async fn on_insertion_event(self: &Arc<Self>, event: InsertionEvent) {
        if let Some(restored) = self.cache.restore(&event.inserted_id) {
            debug!(task_id = %event.parent_id, entries = restored, "Restored host cache");
            self.cache.clear_snapshot(&event.inserted_id);
        }
        self.events.emit(
            &event.parent_id,
            RuntimeEvent::InsertionEnded {
                inserted_task_id: event.inserted_id.clone(),
                reason: event.reason.to_string(),
            },
        );

        if event.reason != InsertionStatus::Completed {
            let live = self
                .state
                .graph_status(&event.inserted_id)
                .map_or(false, |s| !s.is_terminal());
            let registered = self.registry.lock().await.contains_key(&event.inserted_id);
            if live && registered {
                if let Err(e) = self.cancel(&event.inserted_id).await {
                    warn!(inserted_id = %event.inserted_id, error = %e, "Could not stop inserted task");
                }
            }
        }

        match self.state.graph_status(&event.parent_id) {
            Some(status) if status.is_terminal() => {
                // the host's last node finished during the insertion
                self.on_terminal(&event.parent_id).await;
            }
            Some(_) => self.signal(&event.parent_id, RunSignal::Run).await,
            None => {}
        }
    }

    async fn wait_for(&self, task_id: &str, timeout: Duration) -> Result<TaskState> {
        let mut status = {
            let registry = self.registry.lock().await;
            registry
                .get(task_id)
                .ok_or_else(|| EngineError::task_not_found(task_id))?
                .status
                .subscribe()
        };
        tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .map_err(|_| EngineError::timeout(format!("wait for {}", task_id), timeout.as_millis() as u64))?
            .map_err(|_| EngineError::internal(format!("task {} was released while waiting", task_id)))?;
        self.state
            .get_state(task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))
    }

    async fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .lock()
            .await
            .keys()
            .filter(|id| {
                self.state
                    .graph_status(id)
                    .map_or(false, |s| !s.is_terminal())
            })
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    async fn shutdown(&self) {
        self.monitor.stop();
        self.cleanup.stop();
        self.reporter.stop();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        let registry = self.registry.lock().await;
        for (task_id, entry) in registry.iter() {
            let _ = entry.control.send(RunSignal::Stop);
            let unfinished = self
                .state
                .graph_status(task_id)
                .map_or(false, |s| !s.is_terminal());
            if unfinished {
                if let Err(e) = self.state.persist(task_id) {
                    warn!(task_id = %task_id, error = %e, "Could not persist task on shutdown");
                }
            }
        }
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "Flush on shutdown failed");
        }
        info!("Orchestrator shut down");
    }
}

#[async_trait]
impl CleanupTarget for Inner {
    async fn release(&self, task_id: &str) {
        if let Some(entry) = self.registry.lock().await.remove(task_id) {
            if let Some(worker) = entry.worker {
                worker.abort();
            }
        }
        self.state.remove_state(task_id);
        self.cache.clear_prefix(&format!("{}.", task_id));
        self.cache.clear_snapshot(task_id);
        self.queue.remove_for_task(task_id);
        if let Err(e) = self.state.delete_persisted(task_id) {
            warn!(task_id = task_id, error = %e, "Could not delete persisted state");
        }
        if let Err(e) = self.store.remove(trees::GRAPHS, task_id) {
            warn!(task_id = task_id, error = %e, "Could not delete persisted graph");
        }
    }

    async fn active_tasks(&self) -> Vec<(String, DateTime<Utc>)> {
        let ids: Vec<String> = self.registry.lock().await.keys().cloned().collect();
        ids.into_iter()
            .filter_map(|id| {
                let state = self.state.get_state(&id)?;
                match state.graph_status {
                    GraphStatus::Running | GraphStatus::Paused => {
                        state.started_at.map(|at| (id, at))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    async fn force_cancel(&self, task_id: &str) -> Result<()> {
        self.state.set_task_status(task_id, GraphStatus::Cancelled)?;
        self.signal(task_id, RunSignal::Stop).await;
        if let Some(entry) = self.queue.active_entry() {
            if entry.parent_id == task_id || entry.inserted_id == task_id {
                self.queue.cancel(&entry.inserted_id)?;
            }
        }
        self.on_terminal(task_id).await;
        Ok(())
    }
}

/// Forward insertion events to the orchestrator until it is dropped
fn spawn_insertion_listener(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<InsertionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.on_insertion_event(event).await;
        }
    })
}

/// Periodically force-expire hung insertions
fn spawn_expiry_loop(inner: Weak<Inner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let expired = inner.queue.auto_expire(None);
            if !expired.is_empty() {
                warn!(expired = ?expired, "Expired hung insertions");
            }
        }
    })
}
