//! Runtime events published to the badge's pub-sub collaborator

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const EVENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    NodeStarted {
        node_id: String,
        node_type: String,
    },
    NodeComplete {
        node_id: String,
        node_type: String,
        unavailable: bool,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: String,
        node_type: String,
        error: String,
        fallback_ran: bool,
    },
    NodeSkipped {
        node_id: String,
    },
    TaskStatusChanged {
        status: String,
        progress: u8,
    },
    InsertionStarted {
        inserted_task_id: String,
        resume_node_id: Option<String>,
    },
    InsertionEnded {
        inserted_task_id: String,
        reason: String,
    },
    FailsafeTriggered {
        reason: String,
        module: Option<String>,
    },
}

impl RuntimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::NodeStarted { .. } => "node_started",
            RuntimeEvent::NodeComplete { .. } => "node_complete",
            RuntimeEvent::NodeFailed { .. } => "node_failed",
            RuntimeEvent::NodeSkipped { .. } => "node_skipped",
            RuntimeEvent::TaskStatusChanged { .. } => "task_status_changed",
            RuntimeEvent::InsertionStarted { .. } => "insertion_started",
            RuntimeEvent::InsertionEnded { .. } => "insertion_ended",
            RuntimeEvent::FailsafeTriggered { .. } => "failsafe_triggered",
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub task_id: String,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub event: RuntimeEvent,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &EventEnvelope);
}

/// Writes every event to the debug log
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        tracing::debug!(
            task_id = %envelope.task_id,
            sequence = envelope.sequence,
            event = envelope.event.name(),
            "Event: {:?}",
            envelope.event
        );
    }
}

/// Collects events in memory
#[derive(Clone, Default)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<EventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    /// Names of the recorded events for one task, in emission order
    pub fn names_for(&self, task_id: &str) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .map(|e| e.event.name())
            .collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Wraps an optional sink and stamps envelopes with a per-emitter sequence
pub struct EventEmitter {
    sink: Option<Arc<dyn EventSink>>,
    sequence: AtomicU64,
}

impl EventEmitter {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self {
            sink,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn emit(&self, task_id: &str, event: RuntimeEvent) {
        if let Some(sink) = &self.sink {
            let envelope = EventEnvelope {
                version: EVENT_VERSION,
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
                task_id: task_id.to_string(),
                timestamp: Utc::now().timestamp_millis(),
                event,
            };
            sink.emit(&envelope);
        }
    }
}
