//! Heartbeat-driven failure detection and the failsafe state

pub mod heartbeat;
pub mod trigger;

pub use heartbeat::{HeartbeatMonitor, ModuleStatus, TimeoutCallback};
pub use trigger::{
    FailsafeRecord, FailsafeTrigger, FixedAnswer, RecoveryPrompt, RecoveryStatus, RestartContext,
};
