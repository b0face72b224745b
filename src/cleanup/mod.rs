//! Delayed release of finished tasks, task timeouts and log retention

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::errors::Result;
use crate::core::CleanupConfig;
use crate::storage::{trees, EngineStore};

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Whatever owns the task registries
#[async_trait]
pub trait CleanupTarget: Send + Sync {
    /// Drop every trace of the task: registry, state, cache keys, insertion entries
    async fn release(&self, task_id: &str);

    /// Non-terminal tasks and when they started
    async fn active_tasks(&self) -> Vec<(String, DateTime<Utc>)>;

    async fn force_cancel(&self, task_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub released: Vec<String>,
    pub timed_out: Vec<String>,
    pub logs_pruned: usize,
}

pub struct TaskCleanup {
    config: CleanupConfig,
    store: EngineStore,
    scheduled: Mutex<HashMap<String, DateTime<Utc>>>,
    last_log_prune: Mutex<Option<DateTime<Utc>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskCleanup {
    pub fn new(config: CleanupConfig, store: EngineStore) -> Self {
        Self {
            config,
            store,
            scheduled: Mutex::new(HashMap::new()),
            last_log_prune: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Release the task after the grace delay, or on the next tick when `immediate`
    pub fn schedule(&self, task_id: &str, immediate: bool) -> DateTime<Utc> {
        let now = Utc::now();
        let due = if immediate {
            now
        } else {
            now + chrono_duration(self.config.grace_delay)
        };
        self.scheduled.lock().insert(task_id.to_string(), due);
        debug!(task_id = task_id, immediate = immediate, due = %due, "Scheduled task cleanup");
        due
    }

    pub fn cancel_scheduled(&self, task_id: &str) -> bool {
        self.scheduled.lock().remove(task_id).is_some()
    }

    /// Scheduled releases, soonest first
    pub fn pending(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut pending: Vec<_> = self
            .scheduled
            .lock()
            .iter()
            .map(|(id, due)| (id.clone(), *due))
            .collect();
        pending.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        pending
    }

    /// One deterministic pass of the background loop
    pub async fn sweep(&self, now: DateTime<Utc>, target: &dyn CleanupTarget) -> SweepReport {
        let mut report = SweepReport::default();

        let due: Vec<String> = {
            let mut scheduled = self.scheduled.lock();
            let due: Vec<String> = scheduled
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &due {
                scheduled.remove(id);
            }
            due
        };
        for task_id in due {
            target.release(&task_id).await;
            info!(task_id = %task_id, "Released task resources");
            report.released.push(task_id);
        }

        let limit = chrono_duration(self.config.task_timeout);
        for (task_id, started_at) in target.active_tasks().await {
            if now - started_at <= limit {
                continue;
            }
            warn!(
                task_id = %task_id,
                running_secs = (now - started_at).num_seconds(),
                "Task exceeded timeout, cancelling"
            );
            if let Err(e) = target.force_cancel(&task_id).await {
                error!(task_id = %task_id, error = %e, "Failed to cancel timed out task");
            }
            self.schedule(&task_id, true);
            report.timed_out.push(task_id);
        }

        let prune_due = {
            let last = self.last_log_prune.lock();
            last.map_or(true, |at| now - at >= chrono_duration(self.config.log_prune_interval))
        };
        if prune_due {
            *self.last_log_prune.lock() = Some(now);
            report.logs_pruned = self.prune_logs(now);
        }
        report
    }

    /// Delete log files and log-tree entries older than the retention window
    pub fn prune_logs(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono_duration(self.config.log_retention);
        let mut removed = 0;

        if let Some(dir) = &self.config.log_dir {
            removed += prune_log_dir(dir, cutoff);
        }
        for tree in [trees::FAILSAFE_LOG, trees::RECOVERY_LOG] {
            match self.store.prune_log_before(tree, cutoff) {
                Ok(n) => removed += n,
                Err(e) => warn!(tree = tree, error = %e, "Failed to prune log tree"),
            }
        }
        if removed > 0 {
            info!(removed = removed, cutoff = %cutoff, "Pruned expired logs");
        }
        removed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop; stops by itself once `target` is dropped
    pub fn start(self: &Arc<Self>, target: Weak<dyn CleanupTarget>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanup = Arc::downgrade(self);
        let running = self.running.clone();
        let tick = self.config.tick;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let (Some(cleanup), Some(target)) = (cleanup.upgrade(), target.upgrade()) else {
                    break;
                };
                cleanup.sweep(Utc::now(), target.as_ref()).await;
            }
            running.store(false, Ordering::SeqCst);
            debug!("Cleanup loop exited");
        });
        *self.handle.lock() = Some(handle);
        info!(tick_ms = tick.as_millis() as u64, "Cleanup loop started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Cleanup loop stopped");
        }
    }
}

impl Drop for TaskCleanup {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

fn prune_log_dir(dir: &Path, cutoff: DateTime<Utc>) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Log directory not readable");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from);
        match modified {
            Ok(modified) if path.is_file() && modified < cutoff => {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove log file"),
                }
            }
            _ => {}
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LogEntry;
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        released: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
        active: Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl CleanupTarget for Recorder {
        async fn release(&self, task_id: &str) {
            self.released.lock().push(task_id.to_string());
        }

        async fn active_tasks(&self) -> Vec<(String, DateTime<Utc>)> {
            self.active.lock().clone()
        }

        async fn force_cancel(&self, task_id: &str) -> Result<()> {
            self.cancelled.lock().push(task_id.to_string());
            self.active.lock().retain(|(id, _)| id != task_id);
            Ok(())
        }
    }

    fn cleanup() -> TaskCleanup {
        TaskCleanup::new(CleanupConfig::default(), EngineStore::temporary().unwrap())
    }

    #[tokio::test]
    async fn test_grace_delay_is_respected() {
        let cleanup = cleanup();
        let target = Recorder::default();
        let due = cleanup.schedule("visit", false);

        let report = cleanup.sweep(Utc::now(), &target).await;
        assert!(report.released.is_empty());
        assert_eq!(cleanup.pending().len(), 1);

        let report = cleanup.sweep(due + chrono::Duration::seconds(1), &target).await;
        assert_eq!(report.released, vec!["visit".to_string()]);
        assert!(cleanup.pending().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_and_cancelled_schedules() {
        let cleanup = cleanup();
        let target = Recorder::default();
        cleanup.schedule("failed", true);
        cleanup.schedule("later", false);
        assert!(cleanup.cancel_scheduled("later"));

        let report = cleanup.sweep(Utc::now(), &target).await;
        assert_eq!(report.released, vec!["failed".to_string()]);
        assert_eq!(*target.released.lock(), vec!["failed".to_string()]);
    }

    #[tokio::test]
    async fn test_overdue_task_is_cancelled_and_scheduled() {
        let cleanup = cleanup();
        let target = Recorder::default();
        let now = Utc::now();
        target.active.lock().push(("stuck".into(), now - chrono::Duration::hours(2)));
        target.active.lock().push(("fresh".into(), now));

        let report = cleanup.sweep(now, &target).await;
        assert_eq!(report.timed_out, vec!["stuck".to_string()]);
        assert_eq!(*target.cancelled.lock(), vec!["stuck".to_string()]);
        assert_eq!(cleanup.pending()[0].0, "stuck");
    }

    #[tokio::test]
    async fn test_logs_pruned_once_per_interval() {
        let store = EngineStore::temporary().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("today.log"), b"fresh").unwrap();
        let config = CleanupConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..CleanupConfig::default()
        };
        let cleanup = TaskCleanup::new(config, store.clone());

        let mut old = LogEntry::new("failsafe_triggered", Value::Null);
        old.timestamp = Utc::now() - chrono::Duration::days(45);
        store.append_log(trees::FAILSAFE_LOG, &old, None).unwrap();
        store
            .append_log(trees::FAILSAFE_LOG, &LogEntry::new("recent", Value::Null), None)
            .unwrap();

        let target = Recorder::default();
        let now = Utc::now();
        assert_eq!(cleanup.sweep(now, &target).await.logs_pruned, 1);
        assert_eq!(store.read_log(trees::FAILSAFE_LOG).unwrap().len(), 1);
        assert!(dir.path().join("today.log").exists());

        store.append_log(trees::FAILSAFE_LOG, &old, None).unwrap();
        let soon = now + chrono::Duration::from_std(Duration::from_secs(60)).unwrap();
        assert_eq!(cleanup.sweep(soon, &target).await.logs_pruned, 0);

        let next_day = now + chrono::Duration::days(1);
        assert_eq!(cleanup.sweep(next_day, &target).await.logs_pruned, 1);
    }
}
