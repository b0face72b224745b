use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::cache::CacheManager;
use crate::cleanup::{CleanupTarget, TaskCleanup};
use crate::core::errors::Result;
use crate::core::EngineConfig;
use crate::executor::{EventEmitter, EventSink, HandlerRegistry, NodeExecutor, NodeHandler};
use crate::failsafe::{FailsafeTrigger, HeartbeatMonitor, RecoveryPrompt};
use crate::graph::GraphLoader;
use crate::insertion::InsertedTaskQueue;
use crate::recovery::{RecoveryOutcome, RestartRecoveryFlow};
use crate::report::{ReportTransport, ReportUploader};
use crate::state::StateManager;
use crate::storage::EngineStore;

use super::{spawn_expiry_loop, spawn_insertion_listener, Inner, Orchestrator};

/// Wires the engine's components together.
///
/// Collaborators that are not supplied fall back to: no handlers (every
/// node degrades to its stub), no event sink, a transport chosen from
/// `report.endpoint`, and a recovery prompt that always says yes.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    handlers: HandlerRegistry,
    fallbacks: Vec<(String, Arc<dyn NodeHandler>)>,
    event_sink: Option<Arc<dyn EventSink>>,
    transport: Option<Arc<dyn ReportTransport>>,
    prompt: Option<Arc<dyn RecoveryPrompt>>,
    store: Option<EngineStore>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            handlers: HandlerRegistry::new(),
            fallbacks: Vec::new(),
            event_sink: None,
            transport: None,
            prompt: None,
            store: None,
        }
    }

    pub fn handler(self, handler: Arc<dyn NodeHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn fallback(mut self, action: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        self.fallbacks.push((action.into(), handler));
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn report_transport(mut self, transport: Arc<dyn ReportTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn recovery_prompt(mut self, prompt: Arc<dyn RecoveryPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Use an already opened store instead of `config.storage_path`
    pub fn store(mut self, store: EngineStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the orchestrator, run restart recovery and start the
    /// background loops. Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => EngineStore::open(&config.storage_path)?,
        };

        let events = Arc::new(EventEmitter::new(self.event_sink));
        let executor = NodeExecutor::new(self.handlers, config.executor.clone())
            .with_events(events.clone());
        for (action, handler) in self.fallbacks {
            executor.register_fallback(action, handler);
        }

        let cache = Arc::new(CacheManager::new(config.cache.clone())?);
        let state = Arc::new(StateManager::new(store.clone()));
        let (insertion_tx, insertion_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(
            InsertedTaskQueue::new(state.clone(), config.insertion.default_timeout)
                .with_events(insertion_tx),
        );

        let monitor = Arc::new(HeartbeatMonitor::new(config.heartbeat.clone()));
        let mut failsafe = FailsafeTrigger::new(store.clone(), state.clone(), cache.clone(), monitor.clone())
            .with_events(events.clone());
        if let Some(prompt) = self.prompt {
            failsafe = failsafe.with_prompt(prompt);
        }
        let failsafe = Arc::new(failsafe);

        let recovery = RestartRecoveryFlow::new(
            store.clone(),
            state.clone(),
            cache.clone(),
            failsafe.clone(),
            config.recovery.log_capacity,
        );
        let cleanup = Arc::new(TaskCleanup::new(config.cleanup.clone(), store.clone()));
        let reporter = Arc::new(match self.transport {
            Some(transport) => ReportUploader::new(transport, store.clone(), config.report.clone()),
            None => ReportUploader::from_config(store.clone(), config.report.clone())?,
        });

        let inner = Arc::new(Inner {
            config,
            store,
            loader: GraphLoader::new(),
            executor: Arc::new(executor),
            cache,
            state,
            queue,
            monitor,
            failsafe,
            recovery,
            cleanup,
            reporter,
            events,
            registry: Mutex::new(HashMap::new()),
            recovery_outcome: SyncMutex::new(None),
            background: SyncMutex::new(Vec::new()),
        });

        if inner.config.recovery.run_on_startup {
            let outcome = run_startup_recovery(&inner).await;
            *inner.recovery_outcome.lock() = Some(outcome);
        }

        let weak = Arc::downgrade(&inner);
        {
            let mut background = inner.background.lock();
            background.push(spawn_insertion_listener(weak.clone(), insertion_rx));
            background.push(spawn_expiry_loop(
                weak.clone(),
                inner.config.insertion.expiry_check_interval,
            ));
        }
        let target: Weak<dyn CleanupTarget> = weak;
        inner.cleanup.start(target);
        inner.reporter.start();
        inner.failsafe.start_monitoring();

        info!(
            storage = %inner.config.storage_path.display(),
            handlers = inner.executor.registry().list().len(),
            "Orchestrator ready"
        );
        Ok(Orchestrator { inner })
    }
}

async fn run_startup_recovery(inner: &Arc<Inner>) -> RecoveryOutcome {
    let outcome = inner.recovery.run_recovery_flow().await;
    let RecoveryOutcome::Recovered { task_id, .. } = &outcome else {
        return outcome;
    };

    match inner.adopt_recovered(task_id).await {
        Ok(()) => outcome,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Recovered task could not be re-registered");
            if let Err(reset_err) = inner.recovery.reset_to_fresh_state(Some(task_id)) {
                warn!(error = %reset_err, "Reset after failed re-registration was incomplete");
            }
            RecoveryOutcome::Reset {
                reason: e.to_string(),
            }
        }
    }
}
