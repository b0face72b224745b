// Core infrastructure shared by every component

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{
    CacheConfig, CleanupConfig, EngineConfig, EngineConfigBuilder, ExecutorConfig,
    HeartbeatConfig, InsertionConfig, LimitsConfig, RecoveryConfig, ReportConfig,
};
pub use errors::{EngineError, Result, TaskKindLimit, Violation};
