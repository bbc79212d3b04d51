//! Error types for the task core.
//!
//! Two families live here. Per-task failures (`TaskError`) never reach the
//! submitter as a fault: they are captured into the task's result entry.
//! Everything else (`Error` and its parts) is returned synchronously.

use serde::{Deserialize, Serialize};

/// Top-level error type for synchronous operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Keyed worker error: {0}")]
    Keyed(#[from] KeyedError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Worker {name} cannot {action} while {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: String,
    },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Schedule line errors, raised when a line is parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Malformed schedule '{line}': expected 5 calendar fields, found {found}")]
    Malformed { line: String, found: usize },

    #[error("Schedule '{line}' has no task bound")]
    NoTask { line: String },
}

/// Queue capacity and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Queue {name} overflowed (capacity {capacity})")]
    Overflow { name: String, capacity: usize },

    #[error("Queue {name} is closed")]
    Closed { name: String },
}

/// Keyed retrieval errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyedError {
    #[error("No result ready for key '{key}'")]
    NotReady { key: String },
}

/// Failures bringing up a unit of execution.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("No tokio runtime available to spawn {name}")]
    NoRuntime { name: String },

    #[error("Failed to spawn thread {name}: {source}")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single task, captured as its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskError {
    #[error("{target}()_MethodNotFound")]
    MethodNotFound { target: String },

    #[error("{target}()_NotCallable")]
    NotCallable { target: String },

    #[error("TargetMustBeCallable: {target}")]
    TargetMustBeCallable { target: String },

    #[error("UnserializableValue: {reason}")]
    UnserializableValue { reason: String },

    #[error("Namespace {name} not found")]
    NamespaceNotFound { name: String },

    #[error("Invalid expression '{text}': {reason}")]
    InvalidExpression { text: String, reason: String },

    #[error("Invalid arguments for {target}: {reason}")]
    InvalidArguments { target: String, reason: String },

    #[error("Execution fault: {0}")]
    ExecutionFault(String),
}

impl TaskError {
    /// Shorthand for a fault raised by the action itself.
    pub fn fault(reason: impl std::fmt::Display) -> Self {
        Self::ExecutionFault(reason.to_string())
    }

    /// Shorthand for a bad argument list.
    pub fn arguments(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the task core.
pub type Result<T> = std::result::Result<T, Error>;
