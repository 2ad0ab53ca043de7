//! Error types for the orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Delay policy error: {0}")]
    Delay(#[from] DelayError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Expression compilation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },
}

impl CompileError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: u64 },

    #[error("Subtask {subtask_id} of task {task_id} not found")]
    SubtaskNotFound { task_id: u64, subtask_id: u32 },

    #[error("Stale assignment: subtask {subtask_id} of task {task_id} is not held by worker {worker_id}")]
    StaleAssignment {
        task_id: u64,
        subtask_id: u32,
        worker_id: String,
    },

    #[error("Arithmetic failure in task {task_id}: {reason}")]
    ArithmeticFailure { task_id: u64, reason: String },

    #[error("Worker {worker_id} timed out after {timeout:?}")]
    WorkerTimeout { worker_id: String, timeout: Duration },
}

/// Delay policy validation errors.
#[derive(Debug, thiserror::Error)]
pub enum DelayError {
    #[error("Unknown operation: {0}")]
    UnknownOperator(String),

    #[error("Delay for {operator} must not be negative (got {value})")]
    Negative { operator: String, value: i64 },

    #[error("Delay for {operator} exceeds the maximum of {max} seconds (got {value})")]
    TooLarge { operator: String, value: i64, max: i64 },
}

/// Errors talking to a remote orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected response status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
