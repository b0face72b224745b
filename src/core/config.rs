use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, Result};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache sizing and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without an explicit one
    pub default_ttl: Duration,
    /// Maximum number of live entries before eviction kicks in
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(600),
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(EngineError::configuration("cache.max_entries cannot be zero"));
        }
        if self.default_ttl.is_zero() {
            return Err(EngineError::configuration("cache.default_ttl cannot be zero"));
        }
        Ok(())
    }
}

/// Liveness monitoring of collaborator modules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the monitor sweeps registered modules
    pub interval: Duration,
    /// A module is considered hung once its last heartbeat is older than this
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(EngineError::configuration("heartbeat.interval cannot be zero"));
        }
        if self.timeout < self.interval {
            return Err(EngineError::configuration(
                "heartbeat.timeout should be greater than heartbeat.interval",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertionConfig {
    /// Timeout applied to an inserted task that does not declare its own
    pub default_timeout: Duration,
    /// Snapshot the host's `{task_id}.` cache keys for the duration of an insertion
    pub snapshot_host_cache: bool,
    /// How often the orchestrator force-expires hung insertions
    pub expiry_check_interval: Duration,
}

impl Default for InsertionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            snapshot_host_cache: true,
            expiry_check_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Delay between a task finishing and its resources being released
    pub grace_delay: Duration,
    /// Active tasks running longer than this are force-cancelled
    pub task_timeout: Duration,
    pub tick: Duration,
    /// Directory of task log files subject to retention; `None` disables file pruning
    pub log_dir: Option<PathBuf>,
    pub log_retention: Duration,
    pub log_prune_interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            grace_delay: Duration::from_secs(120),
            task_timeout: Duration::from_secs(3600),
            tick: Duration::from_secs(10),
            log_dir: None,
            log_retention: DAY * 30,
            log_prune_interval: DAY,
        }
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(EngineError::configuration("cleanup.tick cannot be zero"));
        }
        if self.task_timeout.is_zero() {
            return Err(EngineError::configuration("cleanup.task_timeout cannot be zero"));
        }
        if self.log_retention.is_zero() {
            return Err(EngineError::configuration("cleanup.log_retention cannot be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// HTTP endpoint receiving task reports; `None` means no network capability
    pub endpoint: Option<String>,
    pub user_id: String,
    /// Number of attempts before a report falls back to the pending list
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How often the background loop retries pending reports
    pub retry_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            user_id: "default_user".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retry_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ReportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(EngineError::configuration("report.max_retries must be at least 1"));
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(EngineError::configuration(format!(
                    "report.endpoint must be an http(s) URL, got {}",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_main_tasks: usize,
    pub max_inserted_tasks: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_main_tasks: 1,
            max_inserted_tasks: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Bound on a handler call when the node has no `timeout` of its own
    pub default_node_timeout: Duration,
    /// Treat a missing collaborator as a node failure instead of a stub result
    pub strict_collaborators: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_node_timeout: Duration::from_secs(300),
            strict_collaborators: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run the restart-recovery flow while building the orchestrator
    pub run_on_startup: bool,
    /// Number of recovery log entries kept in storage
    pub log_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            log_capacity: 100,
        }
    }
}

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the embedded database
    pub storage_path: PathBuf,
    pub cache: CacheConfig,
    pub heartbeat: HeartbeatConfig,
    pub insertion: InsertionConfig,
    pub cleanup: CleanupConfig,
    pub report: ReportConfig,
    pub limits: LimitsConfig,
    pub executor: ExecutorConfig,
    pub recovery: RecoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data/engine"),
            cache: CacheConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            insertion: InsertionConfig::default(),
            cleanup: CleanupConfig::default(),
            report: ReportConfig::default(),
            limits: LimitsConfig::default(),
            executor: ExecutorConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load a configuration from a YAML file; missing fields take their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("read config {}", path.display()), e))?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(EngineError::configuration("storage_path cannot be empty"));
        }
        self.cache.validate()?;
        self.heartbeat.validate()?;
        self.cleanup.validate()?;
        self.report.validate()?;

        if self.limits.max_main_tasks == 0 {
            return Err(EngineError::configuration("limits.max_main_tasks must be at least 1"));
        }
        if self.insertion.default_timeout.is_zero() {
            return Err(EngineError::configuration(
                "insertion.default_timeout cannot be zero",
            ));
        }
        if self.insertion.expiry_check_interval.is_zero() {
            return Err(EngineError::configuration(
                "insertion.expiry_check_interval cannot be zero",
            ));
        }
        if self.executor.default_node_timeout.is_zero() {
            return Err(EngineError::configuration(
                "executor.default_node_timeout cannot be zero",
            ));
        }
        if self.recovery.log_capacity == 0 {
            return Err(EngineError::configuration("recovery.log_capacity cannot be zero"));
        }
        Ok(())
    }

    /// Short intervals for development and tests
    pub fn development() -> Self {
        Self {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(200),
            },
            insertion: InsertionConfig {
                expiry_check_interval: Duration::from_millis(50),
                ..Default::default()
            },
            cleanup: CleanupConfig {
                grace_delay: Duration::from_secs(1),
                tick: Duration::from_millis(50),
                ..Default::default()
            },
            report: ReportConfig {
                retry_delay: Duration::from_millis(10),
                retry_interval: Duration::from_secs(1),
                ..Default::default()
            },
            executor: ExecutorConfig {
                default_node_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Tighter footprint for the badge hardware
    pub fn embedded() -> Self {
        Self {
            cache: CacheConfig {
                max_entries: 256,
                ..Default::default()
            },
            cleanup: CleanupConfig {
                log_retention: DAY * 7,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Start from an existing configuration, e.g. a preset
    pub fn from_config(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = path.into();
        self
    }

    pub fn cache(mut self, default_ttl: Duration, max_entries: usize) -> Self {
        self.config.cache = CacheConfig {
            default_ttl,
            max_entries,
        };
        self
    }

    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.heartbeat = HeartbeatConfig { interval, timeout };
        self
    }

    pub fn insertion_timeout(mut self, timeout: Duration) -> Self {
        self.config.insertion.default_timeout = timeout;
        self
    }

    pub fn grace_delay(mut self, delay: Duration) -> Self {
        self.config.cleanup.grace_delay = delay;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.cleanup.task_timeout = timeout;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cleanup.log_dir = Some(dir.into());
        self
    }

    pub fn report_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.report.endpoint = Some(endpoint.into());
        self
    }

    pub fn report_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.config.report.max_retries = max_retries;
        self.config.report.retry_delay = retry_delay;
        self
    }

    pub fn limits(mut self, max_main_tasks: usize, max_inserted_tasks: usize) -> Self {
        self.config.limits = LimitsConfig {
            max_main_tasks,
            max_inserted_tasks,
        };
        self
    }

    pub fn strict_collaborators(mut self, strict: bool) -> Self {
        self.config.executor.strict_collaborators = strict;
        self
    }

    pub fn recovery_on_startup(mut self, enabled: bool) -> Self {
        self.config.recovery.run_on_startup = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
