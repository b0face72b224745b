//! Restart recovery, run once when the process starts.
//!
//! A valid [`RestartContext`] left behind by the failsafe is offered to the
//! wearer. Whatever happens next, the context is consumed so a task that
//! keeps crashing the badge is never recovered twice.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::cache::CacheManager;
use crate::core::errors::{EngineError, Result};
use crate::failsafe::{FailsafeTrigger, RestartContext};
use crate::graph::TaskGraph;
use crate::state::StateManager;
use crate::storage::{trees, EngineStore, LogEntry};

const CURRENT: &str = "current";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    NoContext,
    Recovered {
        task_id: String,
        last_node_id: Option<String>,
    },
    Reset {
        reason: String,
    },
}

pub struct RestartRecoveryFlow {
    store: EngineStore,
    state: Arc<StateManager>,
    cache: Arc<CacheManager>,
    failsafe: Arc<FailsafeTrigger>,
    log_capacity: usize,
}

impl RestartRecoveryFlow {
    pub fn new(
        store: EngineStore,
        state: Arc<StateManager>,
        cache: Arc<CacheManager>,
        failsafe: Arc<FailsafeTrigger>,
        log_capacity: usize,
    ) -> Self {
        Self {
            store,
            state,
            cache,
            failsafe,
            log_capacity,
        }
    }

    pub fn get_restart_context(&self) -> Option<RestartContext> {
        match self.store.get_json(trees::RESTART_CONTEXT, CURRENT) {
            Ok(context) => context,
            Err(e) => {
                error!(error = %e, "Failed to read restart context");
                None
            }
        }
    }

    pub fn check_restart_context(&self) -> bool {
        self.get_restart_context().map_or(false, |c| c.valid)
    }

    /// check → load → prompt → recover or reset
    pub async fn run_recovery_flow(&self) -> RecoveryOutcome {
        let context = match self.get_restart_context() {
            Some(context) if context.valid => context,
            _ => {
                info!("No restart context, starting fresh");
                return RecoveryOutcome::NoContext;
            }
        };
        info!(
            task_id = %context.task_id,
            last_node = ?context.last_node_id,
            reason = %context.reason,
            "Found restart context"
        );

        let choice = self.failsafe.prompt_user_for_recovery(&context).await;
        self.log(
            "user_choice",
            json!({
                "task_id": context.task_id,
                "last_node_id": context.last_node_id,
                "user_choice": if choice { "recover" } else { "reset" },
                "reason": context.reason,
            }),
        );

        if !choice {
            return self.reset(Some(&context.task_id), "user declined recovery");
        }

        match self.execute_recovery(&context) {
            Ok(()) => RecoveryOutcome::Recovered {
                task_id: context.task_id,
                last_node_id: context.last_node_id,
            },
            Err(e) => self.handle_recovery_failure(&context, &e.to_string()),
        }
    }

    /// Reinstall the task named by `context`. The context is consumed first.
    pub fn execute_recovery(&self, context: &RestartContext) -> Result<()> {
        self.invalidate_context()?;

        let graph: Option<TaskGraph> = self.store.get_json(trees::GRAPHS, &context.task_id)?;
        if graph.is_none() {
            return Err(EngineError::recovery(format!(
                "graph for task {} was not persisted",
                context.task_id
            )));
        }
        self.failsafe.restore_task_from_cache(&context.task_id)?;

        self.log(
            "recovery_success",
            json!({"task_id": context.task_id, "last_node_id": context.last_node_id}),
        );
        info!(task_id = %context.task_id, "Recovery succeeded");
        Ok(())
    }

    pub fn handle_recovery_failure(&self, context: &RestartContext, reason: &str) -> RecoveryOutcome {
        error!(task_id = %context.task_id, reason = reason, "Recovery failed");
        self.log(
            "recovery_failed",
            json!({
                "task_id": context.task_id,
                "last_node_id": context.last_node_id,
                "error": reason,
            }),
        );
        self.reset(Some(&context.task_id), reason)
    }

    fn reset(&self, task_id: Option<&str>, reason: &str) -> RecoveryOutcome {
        if let Err(e) = self.reset_to_fresh_state(task_id) {
            error!(error = %e, "Reset to fresh state was incomplete");
        }
        RecoveryOutcome::Reset {
            reason: reason.to_string(),
        }
    }

    /// Drop caches, snapshots, failsafe flags and the task's state
    pub fn reset_to_fresh_state(&self, task_id: Option<&str>) -> Result<()> {
        info!(task_id = ?task_id, "Resetting to fresh state");
        self.invalidate_context()?;
        self.cache.clear_all();
        self.failsafe.clear_failsafe_mode()?;

        if let Some(task_id) = task_id {
            self.state.remove_state(task_id);
            self.state.delete_persisted(task_id)?;
            self.store.remove(trees::CACHE_BACKUP, task_id)?;
            self.store.remove(trees::GRAPHS, task_id)?;
        }
        self.log("reset", json!({"task_id": task_id}));
        self.store.flush()
    }

    /// Mark the context consumed; it is kept for inspection, never deleted.
    fn invalidate_context(&self) -> Result<()> {
        if let Some(mut context) = self.get_restart_context() {
            if context.valid {
                context.valid = false;
                self.store.put_json(trees::RESTART_CONTEXT, CURRENT, &context)?;
                self.store.flush()?;
            }
        }
        Ok(())
    }

    fn log(&self, event: &str, details: serde_json::Value) {
        let entry = LogEntry::new(event, details);
        if let Err(e) = self
            .store
            .append_log(trees::RECOVERY_LOG, &entry, Some(self.log_capacity))
        {
            warn!(event = event, error = %e, "Failed to write recovery log");
        }
    }

    pub fn recovery_log(&self) -> Result<Vec<LogEntry>> {
        self.store.read_log(trees::RECOVERY_LOG)
    }
}
