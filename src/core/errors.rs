use std::fmt;
use thiserror::Error;

/// A single problem found while validating a task-graph definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON-pointer-like location, e.g. `nodes[2].type`
    pub path: String,
    pub message: String,
}

impl Violation {
    pub fn new<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Which registration limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKindLimit {
    Main,
    Inserted,
}

impl fmt::Display for TaskKindLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => f.write_str("main"),
            Self::Inserted => f.write_str("inserted"),
        }
    }
}

/// Unified error type for the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph definition is malformed; carries every violation found
    #[error("Validation failed with {} violation(s): {}", violations.len(), join_violations(violations))]
    Validation { violations: Vec<Violation> },

    #[error("Unknown node type: {node_type}")]
    UnknownNodeType { node_type: String },

    /// Collaborator failure while executing a node
    #[error("Execution failed in {component}: {message}")]
    Execution { component: String, message: String },

    #[error("Nested insertion not supported: {active_inserted_id} is already active for {parent_id}")]
    NestingNotSupported {
        parent_id: String,
        active_inserted_id: String,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Node {node_id} not found in task {task_id}")]
    NodeNotFound { task_id: String, node_id: String },

    #[error("Task already registered: {task_id}")]
    TaskAlreadyExists { task_id: String },

    #[error("Invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {task_id} already has an active inserted task")]
    InsertionAlreadyActive { task_id: String },

    #[error("Too many {kind} tasks (limit: {limit})")]
    TaskLimit { kind: TaskKindLimit, limit: usize },

    #[error("Recovery failed: {reason}")]
    Recovery { reason: String },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Report upload failed for {task_id}: {message}")]
    Upload { task_id: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: sled::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn validation(violations: Vec<Violation>) -> Self {
        Self::Validation { violations }
    }

    pub fn execution<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    pub fn node_not_found<T: Into<String>, N: Into<String>>(task_id: T, node_id: N) -> Self {
        Self::NodeNotFound {
            task_id: task_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn invalid_transition<S: Into<String>>(
        task_id: S,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            task_id: task_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn recovery<S: Into<String>>(reason: S) -> Self {
        Self::Recovery {
            reason: reason.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn upload<T: Into<String>, M: Into<String>>(task_id: T, message: M) -> Self {
        Self::Upload {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn database<S: Into<String>>(operation: S, source: sled::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Violations carried by a validation error, empty otherwise.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation { violations } => violations,
            _ => &[],
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io { .. } | Self::Database { .. } => true,
            Self::Upload { .. } => true,
            Self::TaskLimit { .. } | Self::NestingNotSupported { .. } => true, // retry once the slot frees up
            Self::Validation { .. } | Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::UnknownNodeType { .. } => "unknown_node_type",
            Self::Execution { .. } => "execution",
            Self::NestingNotSupported { .. } => "nesting",
            Self::TaskNotFound { .. } | Self::NodeNotFound { .. } => "not_found",
            Self::TaskAlreadyExists { .. } => "conflict",
            Self::InvalidTransition { .. } | Self::InsertionAlreadyActive { .. } => "state",
            Self::TaskLimit { .. } => "limit",
            Self::Recovery { .. } => "recovery",
            Self::Timeout { .. } => "timeout",
            Self::Upload { .. } => "upload",
            Self::Configuration { .. } => "configuration",
            Self::Database { .. } => "database",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_every_violation() {
        let err = EngineError::validation(vec![
            Violation::new("graph_id", "missing required field"),
            Violation::new("nodes[0].type", "missing required field"),
        ]);
        let message = err.to_string();
        assert!(message.contains("2 violation(s)"));
        assert!(message.contains("graph_id"));
        assert!(message.contains("nodes[0].type"));
        assert_eq!(err.violations().len(), 2);
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn test_error_recoverability() {
        assert!(EngineError::timeout("node", 1000).is_recoverable());
        assert!(!EngineError::validation(vec![]).is_recoverable());
        assert!(!EngineError::configuration("bad").is_recoverable());
        assert!(EngineError::NestingNotSupported {
            parent_id: "main".into(),
            active_inserted_id: "detour".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = json_err.into();
        assert_eq!(err.category(), "serialization");

        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, EngineError::Internal { .. }));
    }
}
