use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cache::{CacheEntry, CacheManager};
use crate::core::errors::{EngineError, Result};
use crate::executor::{EventEmitter, RuntimeEvent};
use crate::state::StateManager;
use crate::storage::{trees, EngineStore, LogEntry};

use super::heartbeat::HeartbeatMonitor;

const CURRENT: &str = "current";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailsafeRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub active_task_id: Option<String>,
    #[serde(default)]
    pub last_known_node: Option<String>,
    #[serde(default)]
    pub recovery_available: bool,
    #[serde(default)]
    pub module_name: Option<String>,
}

/// What the next process start needs to offer recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartContext {
    pub task_id: String,
    #[serde(default)]
    pub last_node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    /// False once a recovery flow has consumed it
    #[serde(default)]
    pub valid: bool,
}

/// Asks the wearer whether to resume the interrupted task
#[async_trait]
pub trait RecoveryPrompt: Send + Sync {
    async fn confirm_recovery(&self, context: &RestartContext) -> bool;
}

/// Prompt that always answers with a fixed choice
pub struct FixedAnswer(pub bool);

#[async_trait]
impl RecoveryPrompt for FixedAnswer {
    async fn confirm_recovery(&self, _context: &RestartContext) -> bool {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub failsafe_mode: bool,
    pub has_recovery: bool,
    pub record: Option<FailsafeRecord>,
}

/// Declares the failsafe state and keeps what is needed to come back from it
pub struct FailsafeTrigger {
    store: EngineStore,
    state: Arc<StateManager>,
    cache: Arc<CacheManager>,
    monitor: Arc<HeartbeatMonitor>,
    prompt: Option<Arc<dyn RecoveryPrompt>>,
    events: Arc<EventEmitter>,
    failsafe_mode: AtomicBool,
    current: Mutex<Option<FailsafeRecord>>,
}

impl FailsafeTrigger {
    pub fn new(
        store: EngineStore,
        state: Arc<StateManager>,
        cache: Arc<CacheManager>,
        monitor: Arc<HeartbeatMonitor>,
    ) -> Self {
        Self {
            store,
            state,
            cache,
            monitor,
            prompt: None,
            events: Arc::new(EventEmitter::disabled()),
            failsafe_mode: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn RecoveryPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_events(mut self, events: Arc<EventEmitter>) -> Self {
        self.events = events;
        self
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Start heartbeat monitoring with a breach triggering the failsafe
    pub fn start_monitoring(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.monitor.start(Arc::new(move |module, elapsed| {
            if let Some(trigger) = weak.upgrade() {
                let reason = format!(
                    "module {} heartbeat timed out ({}s)",
                    module,
                    elapsed.as_secs()
                );
                trigger.trigger_failsafe(&reason, Some(module));
            }
        }));
    }

    /// Record the failure, persist the active task and enter failsafe mode.
    ///
    /// Persistence problems are logged and mark the record as not
    /// recoverable; the failsafe state is entered regardless.
    pub fn trigger_failsafe(&self, reason: &str, module: Option<&str>) -> FailsafeRecord {
        error!(reason = reason, module = ?module, "Triggering failsafe");

        let active = self.state.active_task();
        let (active_task_id, last_known_node) = match active {
            Some((task_id, node)) => (Some(task_id), node),
            None => (None, None),
        };

        let mut record = FailsafeRecord {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            active_task_id: active_task_id.clone(),
            last_known_node: last_known_node.clone(),
            recovery_available: active_task_id.is_some(),
            module_name: module.map(str::to_string),
        };

        if let Some(task_id) = &active_task_id {
            if let Err(e) = self.persist_task(task_id, last_known_node.clone(), reason) {
                error!(task_id = %task_id, error = %e, "Failed to persist task for recovery");
                record.recovery_available = false;
            }
        }

        if let Err(e) = self.store.put_json(trees::FAILSAFE, CURRENT, &record) {
            error!(error = %e, "Failed to persist failsafe record");
        }
        let entry = LogEntry::new("failsafe_triggered", json!(record));
        if let Err(e) = self.store.append_log(trees::FAILSAFE_LOG, &entry, None) {
            error!(error = %e, "Failed to append failsafe log");
        }
        if let Err(e) = self.store.flush() {
            error!(error = %e, "Failed to flush failsafe data");
        }

        *self.current.lock() = Some(record.clone());
        self.failsafe_mode.store(true, Ordering::SeqCst);
        self.monitor.stop();

        self.events.emit(
            active_task_id.as_deref().unwrap_or(""),
            RuntimeEvent::FailsafeTriggered {
                reason: reason.to_string(),
                module: record.module_name.clone(),
            },
        );
        error!(
            task_id = ?record.active_task_id,
            recovery_available = record.recovery_available,
            "Entered failsafe mode"
        );
        record
    }

    fn persist_task(&self, task_id: &str, last_node_id: Option<String>, reason: &str) -> Result<()> {
        self.state.persist(task_id)?;
        let entries = self.cache.export_prefix(&format!("{}.", task_id));
        self.store.put_json(trees::CACHE_BACKUP, task_id, &entries)?;
        let context = RestartContext {
            task_id: task_id.to_string(),
            last_node_id,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            valid: true,
        };
        self.store.put_json(trees::RESTART_CONTEXT, CURRENT, &context)?;
        info!(task_id = task_id, cache_entries = entries.len(), "Saved restart context");
        Ok(())
    }

    /// Ask the wearer whether to recover; yes when no prompt is wired
    pub async fn prompt_user_for_recovery(&self, context: &RestartContext) -> bool {
        let choice = match &self.prompt {
            Some(prompt) => prompt.confirm_recovery(context).await,
            None => true,
        };
        info!(task_id = %context.task_id, choice = choice, "Recovery prompt answered");
        choice
    }

    /// Reinstall the recorded task's state and cache entries.
    ///
    /// Clears failsafe mode and restarts monitoring on success.
    pub fn restore_task_from_cache(&self, task_id: &str) -> Result<()> {
        let state = self.state.load_latest(task_id)?.ok_or_else(|| {
            EngineError::recovery(format!("no persisted state for task {}", task_id))
        })?;

        let entries: Vec<CacheEntry> = self
            .store
            .get_json(trees::CACHE_BACKUP, task_id)?
            .unwrap_or_default();
        let restored = self.cache.import_entries(entries);
        self.store.remove(trees::CACHE_BACKUP, task_id)?;

        self.clear_failsafe_mode()?;
        if self.monitor.restart() {
            info!("Heartbeat monitoring resumed after recovery");
        }
        info!(
            task_id = task_id,
            nodes = state.nodes.len(),
            cache_entries = restored,
            "Restored task from failsafe snapshot"
        );
        Ok(())
    }

    pub fn is_failsafe_mode(&self) -> bool {
        self.failsafe_mode.load(Ordering::SeqCst)
    }

    /// The in-memory record, else the one persisted before a restart
    pub fn current_record(&self) -> Option<FailsafeRecord> {
        if let Some(record) = self.current.lock().clone() {
            return Some(record);
        }
        match self.store.get_json(trees::FAILSAFE, CURRENT) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to read failsafe record");
                None
            }
        }
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        let record = self.current_record();
        RecoveryStatus {
            failsafe_mode: self.is_failsafe_mode(),
            has_recovery: record.as_ref().map_or(false, |r| r.recovery_available),
            record,
        }
    }

    pub fn clear_failsafe_mode(&self) -> Result<()> {
        self.failsafe_mode.store(false, Ordering::SeqCst);
        *self.current.lock() = None;
        self.store.remove(trees::FAILSAFE, CURRENT)?;
        let entry = LogEntry::new("failsafe_cleared", json!({}));
        self.store.append_log(trees::FAILSAFE_LOG, &entry, None)?;
        info!("Failsafe mode cleared");
        Ok(())
    }

    pub fn failsafe_log(&self) -> Result<Vec<LogEntry>> {
        self.store.read_log(trees::FAILSAFE_LOG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CacheConfig, HeartbeatConfig};
    use crate::state::NodeStatus;
    use std::time::Duration;

    fn setup() -> (EngineStore, Arc<StateManager>, Arc<CacheManager>, FailsafeTrigger) {
        let store = EngineStore::temporary().unwrap();
        let state = Arc::new(StateManager::new(store.clone()));
        let cache = Arc::new(CacheManager::new(CacheConfig::default()).unwrap());
        let monitor = Arc::new(HeartbeatMonitor::new(HeartbeatConfig::default()));
        let trigger = FailsafeTrigger::new(store.clone(), state.clone(), cache.clone(), monitor);
        (store, state, cache, trigger)
    }

    #[test]
    fn test_trigger_persists_context_and_cache() {
        let (store, state, cache, trigger) = setup();
        let ids = vec!["a".to_string(), "b".to_string()];
        state.init("visit", &ids);
        state.mark_started("visit").unwrap();
        state
            .update_node_status("visit", "a", NodeStatus::Running, None)
            .unwrap();
        cache.set("visit.a", json!({"floor": 2}), None);
        cache.set("other.a", json!(1), None);

        let record = trigger.trigger_failsafe("navigation hung", Some("navigation"));
        assert!(trigger.is_failsafe_mode());
        assert!(record.recovery_available);
        assert_eq!(record.active_task_id.as_deref(), Some("visit"));
        assert_eq!(record.last_known_node.as_deref(), Some("a"));

        let context: RestartContext = store
            .get_json(trees::RESTART_CONTEXT, CURRENT)
            .unwrap()
            .unwrap();
        assert!(context.valid);
        let backup: Vec<CacheEntry> = store.get_json(trees::CACHE_BACKUP, "visit").unwrap().unwrap();
        assert_eq!(backup.len(), 1);
        assert_eq!(trigger.failsafe_log().unwrap().len(), 1);
    }

    #[test]
    fn test_trigger_without_active_task_is_not_recoverable() {
        let (_, _, _, trigger) = setup();
        let record = trigger.trigger_failsafe("speech backend crashed", None);
        assert!(!record.recovery_available);
        assert!(!trigger.recovery_status().has_recovery);
    }

    #[test]
    fn test_restore_reinstalls_state_and_clears_mode() {
        let (_, state, cache, trigger) = setup();
        state.init("visit", &["a".to_string()]);
        state.mark_started("visit").unwrap();
        cache.set("visit.a", json!("kept"), Some(Duration::from_secs(60)));
        trigger.trigger_failsafe("hung", Some("vision"));

        state.clear_all();
        cache.clear_all();
        trigger.restore_task_from_cache("visit").unwrap();

        assert!(state.contains("visit"));
        assert_eq!(cache.get("visit.a"), Some(json!("kept")));
        assert!(!trigger.is_failsafe_mode());
        assert!(trigger.current_record().is_none());
    }

    #[test]
    fn test_restore_without_snapshot_fails() {
        let (_, _, _, trigger) = setup();
        let err = trigger.restore_task_from_cache("missing").unwrap_err();
        assert!(matches!(err, EngineError::Recovery { .. }));
    }

    #[tokio::test]
    async fn test_prompt_defaults_to_yes() {
        let (store, state, cache, _) = setup();
        let monitor = Arc::new(HeartbeatMonitor::new(HeartbeatConfig::default()));
        let context = RestartContext {
            task_id: "visit".into(),
            last_node_id: None,
            timestamp: Utc::now(),
            reason: "test".into(),
            valid: true,
        };
        let plain = FailsafeTrigger::new(store.clone(), state.clone(), cache.clone(), monitor.clone());
        assert!(plain.prompt_user_for_recovery(&context).await);

        let declining = FailsafeTrigger::new(store, state, cache, monitor)
            .with_prompt(Arc::new(FixedAnswer(false)));
        assert!(!declining.prompt_user_for_recovery(&context).await);
    }
}
