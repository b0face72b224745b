use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::state::model::{
    output_map, GraphStatus, InsertedTaskInfo, NodeStatus, StateSummary, TaskState,
};
use crate::storage::{atomic_write, timestamp_key, trees, EngineStore};

/// Length of a `timestamp_key` suffix, used to tell `{task}_{ts}` keys apart
/// from keys of a task whose id merely shares the prefix.
const TIMESTAMP_KEY_LEN: usize = 22;

fn snapshot_key(task_id: &str) -> String {
    format!("{}_{}", task_id, timestamp_key(Utc::now()))
}

fn is_snapshot_of(key: &str, task_id: &str) -> bool {
    key.strip_prefix(task_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .map_or(false, |ts| ts.len() == TIMESTAMP_KEY_LEN && !ts.contains('_'))
}

/// Owns every [`TaskState`]; all mutation goes through here.
pub struct StateManager {
    states: DashMap<String, TaskState>,
    store: EngineStore,
}

impl StateManager {
    pub fn new(store: EngineStore) -> Self {
        Self {
            states: DashMap::new(),
            store,
        }
    }

    /// Create all-pending state for a task, replacing any previous one
    pub fn init(&self, task_id: &str, node_ids: &[String]) -> TaskState {
        let state = TaskState::new(task_id, node_ids);
        self.states.insert(task_id.to_string(), state.clone());
        info!(task_id = task_id, nodes = node_ids.len(), "Initialised task state");
        state
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.states.contains_key(task_id)
    }

    fn with_state<T>(&self, task_id: &str, f: impl FnOnce(&mut TaskState) -> Result<T>) -> Result<T> {
        let mut state = self
            .states
            .get_mut(task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let result = f(state.value_mut())?;
        state.updated_at = Utc::now();
        Ok(result)
    }

    /// Move a node to `status` and re-derive progress and graph status.
    ///
    /// While the task is paused for an insertion the node is still recorded,
    /// but graph-status changes wait for the resume.
    pub fn update_node_status(
        &self,
        task_id: &str,
        node_id: &str,
        status: NodeStatus,
        output: Option<Value>,
    ) -> Result<GraphStatus> {
        let graph_status = self.with_state(task_id, |state| {
            let now = Utc::now();
            let node = state
                .node_mut(node_id)
                .ok_or_else(|| EngineError::node_not_found(task_id, node_id))?;
            node.status = status;
            node.timestamp = now;
            if let Some(output) = output {
                node.output = output_map(output);
            }

            if status == NodeStatus::Running && !state.graph_status.is_terminal() {
                state.current_node_id = Some(node_id.to_string());
            }
            state.progress = state.compute_progress();
            state.roll_up(now);
            Ok(state.graph_status)
        })?;

        debug!(
            task_id = task_id,
            node_id = node_id,
            status = %status,
            graph_status = %graph_status,
            "Node status updated"
        );
        Ok(graph_status)
    }

    /// Mark a node running unless the task is paused or finished.
    ///
    /// Checked under the same entry lock as [`pause_for_inserted_task`](Self::pause_for_inserted_task),
    /// so a paused host never starts a node. Returns `false` when refused.
    pub fn start_node(&self, task_id: &str, node_id: &str) -> Result<bool> {
        let started = self.with_state(task_id, |state| {
            if state.graph_status == GraphStatus::Paused || state.graph_status.is_terminal() {
                return Ok(false);
            }
            let now = Utc::now();
            let node = state
                .node_mut(node_id)
                .ok_or_else(|| EngineError::node_not_found(task_id, node_id))?;
            node.status = NodeStatus::Running;
            node.timestamp = now;
            state.current_node_id = Some(node_id.to_string());
            state.roll_up(now);
            Ok(true)
        })?;
        if !started {
            debug!(task_id = task_id, node_id = node_id, "Node start refused");
        }
        Ok(started)
    }

    /// Explicit status transition, checked against the state machine.
    ///
    /// Entering or leaving `paused` is only possible through the insertion
    /// calls below.
    pub fn set_task_status(&self, task_id: &str, status: GraphStatus) -> Result<()> {
        self.with_state(task_id, |state| {
            let from = state.graph_status;
            if from == status {
                return Ok(());
            }
            let via_insertion_only = status == GraphStatus::Paused
                || (from == GraphStatus::Paused && status == GraphStatus::Running);
            if via_insertion_only || !from.can_transition_to(status) {
                return Err(EngineError::invalid_transition(task_id, from, status));
            }

            let now = Utc::now();
            state.graph_status = status;
            match status {
                GraphStatus::Running if state.started_at.is_none() => state.started_at = Some(now),
                GraphStatus::Complete => state.completed_at = Some(now),
                _ => {}
            }
            if status.is_terminal() && state.inserted_task.is_active {
                state.inserted_task = InsertedTaskInfo::default();
            }
            Ok(())
        })?;
        info!(task_id = task_id, status = %status, "Task status changed");
        Ok(())
    }

    /// Pending → running, stamping `started_at`
    pub fn mark_started(&self, task_id: &str) -> Result<()> {
        self.with_state(task_id, |state| match state.graph_status {
            GraphStatus::Pending => {
                state.graph_status = GraphStatus::Running;
                state.started_at = Some(Utc::now());
                Ok(())
            }
            GraphStatus::Running => Ok(()),
            other => Err(EngineError::invalid_transition(task_id, other, GraphStatus::Running)),
        })
    }

    /// Pause a running task for an inserted task and return its resume point.
    pub fn pause_for_inserted_task(
        &self,
        task_id: &str,
        inserted_id: &str,
        current_node: Option<&str>,
    ) -> Result<Option<String>> {
        let resume_point = self.with_state(task_id, |state| {
            if state.inserted_task.is_active {
                return Err(EngineError::InsertionAlreadyActive {
                    task_id: task_id.to_string(),
                });
            }
            if state.graph_status != GraphStatus::Running {
                return Err(EngineError::invalid_transition(
                    task_id,
                    state.graph_status,
                    GraphStatus::Paused,
                ));
            }

            let now = Utc::now();
            let resume_point = current_node
                .map(str::to_string)
                .or_else(|| state.current_node_id.clone());
            state.graph_status = GraphStatus::Paused;
            state.paused_at = Some(now);
            state.inserted_task = InsertedTaskInfo {
                is_active: true,
                paused_main_node: resume_point.clone(),
                inserted_task_id: Some(inserted_id.to_string()),
                pause_time: Some(now),
            };
            Ok(resume_point)
        })?;

        info!(
            task_id = task_id,
            inserted_id = inserted_id,
            resume_point = ?resume_point,
            "Paused task for inserted task"
        );
        Ok(resume_point)
    }

    /// Clear the insertion and resume; `None` when nothing was inserted.
    pub fn resume_from_inserted_task(&self, task_id: &str) -> Result<Option<String>> {
        let resumed = self.with_state(task_id, |state| {
            if !state.inserted_task.is_active {
                return Ok(None);
            }
            let resume_point = state.inserted_task.paused_main_node.clone();
            state.inserted_task = InsertedTaskInfo::default();
            if state.graph_status == GraphStatus::Paused {
                state.graph_status = GraphStatus::Running;
                state.roll_up(Utc::now());
            }
            Ok(Some(resume_point))
        })?;

        match resumed {
            Some(resume_point) => {
                info!(task_id = task_id, resume_point = ?resume_point, "Resumed task after insertion");
                Ok(resume_point)
            }
            None => {
                debug!(task_id = task_id, "No active insertion to resume from");
                Ok(None)
            }
        }
    }

    pub fn get_state(&self, task_id: &str) -> Option<TaskState> {
        self.states.get(task_id).map(|s| s.clone())
    }

    pub fn graph_status(&self, task_id: &str) -> Option<GraphStatus> {
        self.states.get(task_id).map(|s| s.graph_status)
    }

    pub fn get_node_status(&self, task_id: &str, node_id: &str) -> Option<NodeStatus> {
        self.states
            .get(task_id)
            .and_then(|s| s.node(node_id).map(|n| n.status))
    }

    pub fn get_node_output(&self, task_id: &str, node_id: &str) -> Option<Map<String, Value>> {
        self.states
            .get(task_id)
            .and_then(|s| s.node(node_id).map(|n| n.output.clone()))
    }

    /// Replace a node's output without changing its status
    pub fn record_node_output(&self, task_id: &str, node_id: &str, output: Value) -> Result<()> {
        self.with_state(task_id, |state| {
            let node = state
                .node_mut(node_id)
                .ok_or_else(|| EngineError::node_not_found(task_id, node_id))?;
            node.output = output_map(output);
            node.timestamp = Utc::now();
            Ok(())
        })
    }

    /// Shallow-merge `updates` into the task context
    pub fn update_context(&self, task_id: &str, updates: Map<String, Value>) -> Result<()> {
        self.with_state(task_id, |state| {
            state.context.extend(updates);
            Ok(())
        })
    }

    /// Push `value` onto the list stored at `key`, creating it when absent
    pub fn append_context(&self, task_id: &str, key: &str, value: Value) -> Result<()> {
        self.with_state(task_id, |state| {
            let slot = state
                .context
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(items) => items.push(value),
                other => *other = Value::Array(vec![other.take(), value]),
            }
            Ok(())
        })
    }

    pub fn get_context(&self, task_id: &str) -> Option<Map<String, Value>> {
        self.states.get(task_id).map(|s| s.context.clone())
    }

    pub fn summary(&self, task_id: &str) -> Option<StateSummary> {
        self.states.get(task_id).map(|s| s.summary())
    }

    pub fn list_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Best guess at the task a failsafe should record: a paused host first,
    /// else the most recently started running task.
    pub fn active_task(&self) -> Option<(String, Option<String>)> {
        let mut best: Option<(bool, Option<chrono::DateTime<Utc>>, String, Option<String>)> = None;
        for entry in self.states.iter() {
            let state = entry.value();
            let is_host = state.inserted_task.is_active;
            if !is_host && state.graph_status != GraphStatus::Running {
                continue;
            }
            let candidate = (
                is_host,
                state.started_at,
                state.task_id.clone(),
                state.current_node_id.clone(),
            );
            let better = match &best {
                None => true,
                Some((best_host, best_started, _, _)) => {
                    (is_host, state.started_at) > (*best_host, *best_started)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(_, _, task_id, node)| (task_id, node))
    }

    pub fn remove_state(&self, task_id: &str) -> Option<TaskState> {
        let removed = self.states.remove(task_id).map(|(_, s)| s);
        if removed.is_some() {
            debug!(task_id = task_id, "Removed task state");
        }
        removed
    }

    pub fn clear_all(&self) {
        self.states.clear();
    }

    /// Make a recovered task startable again: unfinished nodes return to
    /// pending, any insertion is dropped and the task goes back to pending.
    pub fn prepare_for_recovery(&self, task_id: &str) -> Result<()> {
        self.with_state(task_id, |state| {
            if state.graph_status.is_terminal() {
                return Err(EngineError::recovery(format!(
                    "task {} already finished with status {}",
                    task_id, state.graph_status
                )));
            }
            for node in state.nodes.iter_mut() {
                if node.status == NodeStatus::Running {
                    node.status = NodeStatus::Pending;
                }
            }
            state.inserted_task = InsertedTaskInfo::default();
            state.graph_status = GraphStatus::Pending;
            state.paused_at = None;
            state.progress = state.compute_progress();
            Ok(())
        })
    }

    /// Persist a timestamped snapshot; returns its key.
    pub fn persist(&self, task_id: &str) -> Result<String> {
        let state = self
            .get_state(task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let key = snapshot_key(task_id);
        self.store.put_compressed(trees::TASK_STATES, &key, &state)?;
        self.store.flush()?;
        debug!(task_id = task_id, key = %key, "Persisted task state");
        Ok(key)
    }

    /// Load the snapshot stored under `key` and install it as live state.
    pub fn load(&self, key: &str) -> Result<TaskState> {
        let state: TaskState = self
            .store
            .get_compressed(trees::TASK_STATES, key)?
            .ok_or_else(|| EngineError::task_not_found(key))?;
        self.states.insert(state.task_id.clone(), state.clone());
        info!(task_id = %state.task_id, key = key, "Loaded task state");
        Ok(state)
    }

    /// Load the most recent snapshot of `task_id`, if any
    pub fn load_latest(&self, task_id: &str) -> Result<Option<TaskState>> {
        let latest = self
            .persisted_keys(task_id)?
            .into_iter()
            .last();
        match latest {
            Some(key) => self.load(&key).map(Some),
            None => Ok(None),
        }
    }

    pub fn persisted_keys(&self, task_id: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys_with_prefix(trees::TASK_STATES, &format!("{}_", task_id))?
            .into_iter()
            .filter(|key| is_snapshot_of(key, task_id))
            .collect())
    }

    pub fn delete_persisted(&self, task_id: &str) -> Result<usize> {
        let keys = self.persisted_keys(task_id)?;
        for key in &keys {
            self.store.remove(trees::TASK_STATES, key)?;
        }
        Ok(keys.len())
    }

    /// Write `{task_id}_{timestamp}.json` into `dir` atomically.
    pub fn export_to_file<P: AsRef<Path>>(&self, task_id: &str, dir: P) -> Result<PathBuf> {
        let state = self
            .get_state(task_id)
            .ok_or_else(|| EngineError::task_not_found(task_id))?;
        let path = dir.as_ref().join(format!("{}.json", snapshot_key(task_id)));
        atomic_write(&path, &serde_json::to_vec_pretty(&state)?)?;
        info!(task_id = task_id, path = %path.display(), "Exported task state");
        Ok(path)
    }

    /// Read a state document, defaulting any missing optional fields
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<TaskState> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("read state {}", path.display()), e))?;
        let mut state: TaskState = serde_json::from_str(&content)?;
        let progress = state.compute_progress();
        if progress != state.progress {
            warn!(
                task_id = %state.task_id,
                stored = state.progress,
                computed = progress,
                "Stored progress disagrees with node states; using computed value"
            );
            state.progress = progress;
        }
        self.states.insert(state.task_id.clone(), state.clone());
        Ok(state)
    }
}
