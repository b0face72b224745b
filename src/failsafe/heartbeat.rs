use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::HeartbeatConfig;

/// Invoked with the module name and the time since its last heartbeat
pub type TimeoutCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

#[derive(Debug, Clone)]
struct ModuleHeartbeat {
    last_seen: Instant,
    /// Set once the breach has been reported; cleared by the next heartbeat
    breached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStatus {
    pub module: String,
    pub since_last_heartbeat_ms: u64,
    pub healthy: bool,
}

/// Tracks liveness of the modules the badge depends on
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    modules: Arc<Mutex<HashMap<String, ModuleHeartbeat>>>,
    callback: Arc<Mutex<Option<TimeoutCallback>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            modules: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn register(&self, module: &str) {
        self.modules.lock().insert(
            module.to_string(),
            ModuleHeartbeat {
                last_seen: Instant::now(),
                breached: false,
            },
        );
        info!(module = module, "Registered module for heartbeat monitoring");
    }

    pub fn unregister(&self, module: &str) -> bool {
        self.modules.lock().remove(module).is_some()
    }

    /// Record a heartbeat. Unknown modules are registered on first beat.
    pub fn heartbeat(&self, module: &str) {
        let mut modules = self.modules.lock();
        let entry = modules
            .entry(module.to_string())
            .or_insert_with(|| ModuleHeartbeat {
                last_seen: Instant::now(),
                breached: false,
            });
        if entry.breached {
            info!(module = module, "Module heartbeat recovered");
        }
        entry.last_seen = Instant::now();
        entry.breached = false;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the periodic check. Must be called inside a tokio runtime.
    pub fn start(&self, callback: TimeoutCallback) {
        *self.callback.lock() = Some(callback);
        self.spawn_loop();
    }

    /// Start again with the callback of the previous `start`
    pub fn restart(&self) -> bool {
        if self.callback.lock().is_none() {
            return false;
        }
        self.spawn_loop();
        true
    }

    fn spawn_loop(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Heartbeat monitor already running");
            return;
        }

        let modules = self.modules.clone();
        let callback = self.callback.clone();
        let running = self.running.clone();
        let interval = self.config.interval;
        let timeout = self.config.timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let breaches = sweep(&modules, timeout, Instant::now());
                fire(&callback, &breaches);
            }
            debug!("Heartbeat loop exited");
        });
        *self.handle.lock() = Some(handle);
        info!(
            interval_ms = interval.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Heartbeat monitoring started"
        );
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        info!("Heartbeat monitoring stopped");
    }

    /// One synchronous sweep; returns the newly breached modules.
    pub fn check_now(&self) -> Vec<(String, Duration)> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Vec<(String, Duration)> {
        let breaches = sweep(&self.modules, self.config.timeout, now);
        fire(&self.callback, &breaches);
        breaches
    }

    pub fn module_status(&self) -> Vec<ModuleStatus> {
        let now = Instant::now();
        let mut statuses: Vec<ModuleStatus> = self
            .modules
            .lock()
            .iter()
            .map(|(name, hb)| {
                let elapsed = now.saturating_duration_since(hb.last_seen);
                ModuleStatus {
                    module: name.clone(),
                    since_last_heartbeat_ms: elapsed.as_millis() as u64,
                    healthy: elapsed <= self.config.timeout && !hb.breached,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.module.cmp(&b.module));
        statuses
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

fn sweep(
    modules: &Mutex<HashMap<String, ModuleHeartbeat>>,
    timeout: Duration,
    now: Instant,
) -> Vec<(String, Duration)> {
    let mut breaches = Vec::new();
    for (name, hb) in modules.lock().iter_mut() {
        let elapsed = now.saturating_duration_since(hb.last_seen);
        if elapsed > timeout && !hb.breached {
            hb.breached = true;
            error!(
                module = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Module heartbeat timed out"
            );
            breaches.push((name.clone(), elapsed));
        }
    }
    breaches
}

fn fire(callback: &Mutex<Option<TimeoutCallback>>, breaches: &[(String, Duration)]) {
    if breaches.is_empty() {
        return;
    }
    let Some(callback) = callback.lock().clone() else {
        warn!(count = breaches.len(), "Heartbeat breach with no callback installed");
        return;
    };
    for (module, elapsed) in breaches {
        callback(module, *elapsed);
    }
}
