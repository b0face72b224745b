//! Storage layer
//!
//! Durable state lives in one embedded sled database split into named trees.
//! Files that leave the database (state exports, saved graphs) are written
//! with [`atomic_write`] so a crash never leaves a partial document behind.

pub mod store;

pub use store::{atomic_write, timestamp_key, EngineStore, LogEntry};

/// Tree names used by the engine
pub mod trees {
    pub const TASK_STATES: &str = "task_states";
    pub const GRAPHS: &str = "graphs";
    pub const FAILSAFE: &str = "failsafe";
    pub const FAILSAFE_LOG: &str = "failsafe_log";
    pub const RESTART_CONTEXT: &str = "restart_context";
    pub const RECOVERY_LOG: &str = "recovery_log";
    pub const CACHE_BACKUP: &str = "cache_backup";
    pub const PENDING_REPORTS: &str = "pending_reports";
}
