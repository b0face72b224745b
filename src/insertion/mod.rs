//! Single-level task insertion.
//!
//! At most one inserted task is active system-wide. Registering pauses the
//! host through [`StateManager`]; completing, cancelling or expiring the
//! entry resumes it. Every resume is published as an [`InsertionEvent`] so
//! the orchestrator can wake the host worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::errors::{EngineError, Result};
use crate::state::StateManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionStatus {
    Completed,
    Cancelled,
    Expired,
}

impl fmt::Display for InsertionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InsertionStatus::Completed => "completed",
            InsertionStatus::Cancelled => "cancelled",
            InsertionStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertedTaskEntry {
    pub parent_id: String,
    pub inserted_id: String,
    pub resume_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Own limit; `None` defers to the caller's `max_duration` or the queue default
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InsertedTaskEntry {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn overdue_at(&self, now: DateTime<Utc>, fallback: Duration) -> bool {
        self.age_at(now) > self.timeout.unwrap_or(fallback)
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs.map(|s| Duration::from_secs_f64(s.max(0.0))))
    }
}

/// Published whenever an insertion ends and its host resumes
#[derive(Debug, Clone, PartialEq)]
pub struct InsertionEvent {
    pub parent_id: String,
    pub inserted_id: String,
    pub resume_node_id: Option<String>,
    pub reason: InsertionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Insertions registered since start
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub active_parent: Option<String>,
    pub active_inserted_id: Option<String>,
}

#[derive(Debug, Default)]
struct Entries {
    active: HashMap<String, InsertedTaskEntry>,
    completed: usize,
    cancelled: usize,
    expired: usize,
}

impl Entries {
    fn first_active(&self) -> Option<&InsertedTaskEntry> {
        self.active.values().next()
    }

    fn tally(&mut self, outcome: InsertionStatus) {
        match outcome {
            InsertionStatus::Completed => self.completed += 1,
            InsertionStatus::Cancelled => self.cancelled += 1,
            InsertionStatus::Expired => self.expired += 1,
        }
    }
}

/// Holds only live insertions; finished ones are removed and tallied.
pub struct InsertedTaskQueue {
    state: Arc<StateManager>,
    entries: Mutex<Entries>,
    default_timeout: Duration,
    events: Option<mpsc::UnboundedSender<InsertionEvent>>,
}

impl InsertedTaskQueue {
    pub fn new(state: Arc<StateManager>, default_timeout: Duration) -> Self {
        Self {
            state,
            entries: Mutex::new(Entries::default()),
            default_timeout,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<InsertionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Pause `parent_id` for `inserted_id`, returning the host's resume point.
    ///
    /// Rejected synchronously with `NestingNotSupported` while another
    /// insertion is active; nothing is recorded if the pause fails.
    pub fn register(
        &self,
        parent_id: &str,
        inserted_id: &str,
        resume_node_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<String>> {
        self.expire_overdue(Utc::now(), None);

        let mut entries = self.entries.lock();
        if let Some(active) = entries.first_active() {
            warn!(
                parent_id = parent_id,
                inserted_id = inserted_id,
                active_inserted_id = %active.inserted_id,
                "Rejected nested insertion"
            );
            return Err(EngineError::NestingNotSupported {
                parent_id: parent_id.to_string(),
                active_inserted_id: active.inserted_id.clone(),
            });
        }

        let resume_point = self
            .state
            .pause_for_inserted_task(parent_id, inserted_id, resume_node_id)?;

        let entry = InsertedTaskEntry {
            parent_id: parent_id.to_string(),
            inserted_id: inserted_id.to_string(),
            resume_node_id: resume_point.clone(),
            started_at: Utc::now(),
            timeout,
            metadata: Map::new(),
        };
        info!(
            parent_id = parent_id,
            inserted_id = inserted_id,
            timeout_secs = entry.timeout.unwrap_or(self.default_timeout).as_secs(),
            "Registered inserted task"
        );
        entries.active.insert(inserted_id.to_string(), entry);
        Ok(resume_point)
    }

    /// True while an insertion is active. Overdue entries are expired first.
    pub fn is_active(&self) -> bool {
        self.expire_overdue(Utc::now(), None);
        self.has_active()
    }

    fn has_active(&self) -> bool {
        !self.entries.lock().active.is_empty()
    }

    pub fn complete(&self, inserted_id: &str) -> Result<Option<String>> {
        self.finish(inserted_id, InsertionStatus::Completed)
    }

    pub fn cancel(&self, inserted_id: &str) -> Result<Option<String>> {
        self.finish(inserted_id, InsertionStatus::Cancelled)
    }

    /// Force-complete every entry older than its own timeout. Entries
    /// without one fall back to `max_duration`, then to the queue default.
    /// Returns the expired inserted ids.
    pub fn auto_expire(&self, max_duration: Option<Duration>) -> Vec<String> {
        self.expire_overdue(Utc::now(), max_duration)
    }

    /// [`auto_expire`](Self::auto_expire) against an explicit clock
    pub fn expire_overdue(&self, now: DateTime<Utc>, max_duration: Option<Duration>) -> Vec<String> {
        let fallback = max_duration.unwrap_or(self.default_timeout);
        let overdue: Vec<String> = self
            .entries
            .lock()
            .active
            .values()
            .filter(|e| e.overdue_at(now, fallback))
            .map(|e| e.inserted_id.clone())
            .collect();

        for inserted_id in &overdue {
            warn!(inserted_id = %inserted_id, "Inserted task expired, resuming host");
            if let Err(e) = self.finish(inserted_id, InsertionStatus::Expired) {
                warn!(inserted_id = %inserted_id, error = %e, "Failed to resume host after expiry");
            }
        }
        overdue
    }

    fn finish(&self, inserted_id: &str, outcome: InsertionStatus) -> Result<Option<String>> {
        let parent_id = {
            let mut entries = self.entries.lock();
            match entries.active.remove(inserted_id) {
                Some(entry) => {
                    entries.tally(outcome);
                    entry.parent_id
                }
                None => {
                    debug!(inserted_id = inserted_id, "No active inserted task by that id");
                    return Ok(None);
                }
            }
        };

        let resumed = self.state.resume_from_inserted_task(&parent_id);
        let resume_node_id = resumed.as_ref().ok().cloned().flatten();
        info!(
            parent_id = %parent_id,
            inserted_id = inserted_id,
            outcome = %outcome,
            resume_point = ?resume_node_id,
            "Inserted task finished"
        );

        if let Some(tx) = &self.events {
            let event = InsertionEvent {
                parent_id,
                inserted_id: inserted_id.to_string(),
                resume_node_id,
                reason: outcome,
            };
            if tx.send(event).is_err() {
                debug!("Insertion event receiver dropped");
            }
        }
        resumed
    }

    pub fn active_parent(&self) -> Option<String> {
        self.active_entry().map(|e| e.parent_id)
    }

    pub fn active_inserted_id(&self) -> Option<String> {
        self.active_entry().map(|e| e.inserted_id)
    }

    pub fn active_entry(&self) -> Option<InsertedTaskEntry> {
        self.entries.lock().first_active().cloned()
    }

    /// The live entry for `inserted_id`; `None` once it has finished
    pub fn get(&self, inserted_id: &str) -> Option<InsertedTaskEntry> {
        self.entries.lock().active.get(inserted_id).cloned()
    }

    pub fn list_active(&self) -> Vec<InsertedTaskEntry> {
        self.entries.lock().active.values().cloned().collect()
    }

    pub fn status(&self) -> QueueStatus {
        let entries = self.entries.lock();
        let active = entries.first_active();
        QueueStatus {
            total: entries.active.len() + entries.completed + entries.cancelled + entries.expired,
            active: entries.active.len(),
            completed: entries.completed,
            cancelled: entries.cancelled,
            expired: entries.expired,
            active_parent: active.map(|e| e.parent_id.clone()),
            active_inserted_id: active.map(|e| e.inserted_id.clone()),
        }
    }

    /// Drop any live entry that names `task_id` as host or inserted task, without resuming anything
    pub fn remove_for_task(&self, task_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.active.len();
        entries
            .active
            .retain(|_, e| e.parent_id != task_id && e.inserted_id != task_id);
        before - entries.active.len()
    }

    pub fn clear(&self) {
        self.entries.lock().active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::model::{GraphStatus, NodeStatus};
    use crate::storage::EngineStore;

    fn setup() -> (Arc<StateManager>, InsertedTaskQueue) {
        let state = Arc::new(StateManager::new(EngineStore::temporary().unwrap()));
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        state.init("main", &ids);
        state.mark_started("main").unwrap();
        state
            .update_node_status("main", "a", NodeStatus::Running, None)
            .unwrap();
        let queue = InsertedTaskQueue::new(state.clone(), Duration::from_secs(300));
        (state, queue)
    }

    #[test]
    fn test_register_pauses_host() {
        let (state, queue) = setup();
        let resume = queue.register("main", "toilet", None, None).unwrap();
        assert_eq!(resume.as_deref(), Some("a"));
        assert!(queue.is_active());
        assert_eq!(queue.active_parent().as_deref(), Some("main"));
        assert_eq!(state.graph_status("main"), Some(GraphStatus::Paused));
    }

    #[test]
    fn test_nested_insertion_rejected_without_mutation() {
        let (state, queue) = setup();
        queue.register("main", "toilet", None, None).unwrap();
        let before = state.get_state("main").unwrap();

        let err = queue.register("main", "water", None, None).unwrap_err();
        assert!(matches!(err, EngineError::NestingNotSupported { .. }));
        let after = state.get_state("main").unwrap();
        assert_eq!(before.inserted_task, after.inserted_task);
        assert_eq!(before.graph_status, after.graph_status);
        assert!(queue.get("water").is_none());
    }

    #[test]
    fn test_failed_pause_records_nothing() {
        let (_, queue) = setup();
        let err = queue.register("ghost", "toilet", None, None).unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound { .. }));
        assert!(!queue.is_active());
        assert_eq!(queue.status().total, 0);
    }

    #[test]
    fn test_complete_resumes_and_publishes() {
        let (state, queue) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = queue.with_events(tx);

        queue.register("main", "toilet", Some("b"), None).unwrap();
        let resume = queue.complete("toilet").unwrap();
        assert_eq!(resume.as_deref(), Some("b"));
        assert!(!queue.is_active());
        assert_eq!(state.graph_status("main"), Some(GraphStatus::Running));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, InsertionStatus::Completed);
        assert_eq!(event.parent_id, "main");

        assert_eq!(queue.complete("toilet").unwrap(), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_finished_entries_are_removed() {
        let (state, queue) = setup();
        queue.register("main", "toilet", None, None).unwrap();
        queue.complete("toilet").unwrap();
        assert!(queue.get("toilet").is_none());

        queue.register("main", "water", None, None).unwrap();
        queue.cancel("water").unwrap();
        assert!(queue.get("water").is_none());
        assert!(queue.list_active().is_empty());

        let status = queue.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.active, 0);
        assert_eq!(status.completed, 1);
        assert_eq!(status.cancelled, 1);
    }

    #[test]
    fn test_auto_expire_honours_entry_timeout() {
        let (state, queue) = setup();
        queue
            .register("main", "toilet", None, Some(Duration::from_secs(60)))
            .unwrap();

        // its own 60s limit wins over a shorter caller-supplied maximum
        let later = Utc::now() + chrono::Duration::seconds(30);
        assert!(queue.expire_overdue(later, None).is_empty());
        assert!(queue.expire_overdue(later, Some(Duration::from_secs(10))).is_empty());
        assert!(queue.has_active());

        let much_later = Utc::now() + chrono::Duration::seconds(61);
        let expired = queue.expire_overdue(much_later, Some(Duration::from_secs(600)));
        assert_eq!(expired, vec!["toilet".to_string()]);
        assert!(queue.get("toilet").is_none());
        assert_eq!(queue.status().expired, 1);
        assert_eq!(state.graph_status("main"), Some(GraphStatus::Running));
    }

    #[test]
    fn test_auto_expire_falls_back_to_max_duration() {
        let (_, queue) = setup();
        queue.register("main", "toilet", None, None).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        // queue default is 300s
        assert!(queue.expire_overdue(later, None).is_empty());
        let expired = queue.expire_overdue(later, Some(Duration::from_secs(10)));
        assert_eq!(expired, vec!["toilet".to_string()]);
    }

    #[test]
    fn test_remove_for_task() {
        let (state, queue) = setup();
        queue.register("main", "toilet", None, None).unwrap();
        assert_eq!(queue.remove_for_task("toilet"), 1);
        assert_eq!(queue.status().active, 0);
        // dropped without resuming the host
        assert_eq!(state.graph_status("main"), Some(GraphStatus::Paused));
        assert_eq!(queue.remove_for_task("toilet"), 0);
    }
}
