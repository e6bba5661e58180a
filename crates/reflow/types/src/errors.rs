//! Error types for the Reflow runtime

use serde::{Deserialize, Serialize};

/// Stable classification of every failure the runtime can report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ProcessNotFound,
    ProcessDefinitionNotFound,
    TaskNotFound,
    TaskExecutionError,
    TaskTimeout,
    InvalidTransition,
    ValidationError,
    StorageError,
    PluginError,
    UnknownError,
    FlowNotFound,
    FlowTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProcessNotFound => "PROCESS_NOT_FOUND",
            ErrorKind::ProcessDefinitionNotFound => "PROCESS_DEFINITION_NOT_FOUND",
            ErrorKind::TaskNotFound => "TASK_NOT_FOUND",
            ErrorKind::TaskExecutionError => "TASK_EXECUTION_ERROR",
            ErrorKind::TaskTimeout => "TASK_TIMEOUT",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::PluginError => "PLUGIN_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
            ErrorKind::FlowNotFound => "FLOW_NOT_FOUND",
            ErrorKind::FlowTimeout => "FLOW_TIMEOUT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in Reflow operations
#[derive(Clone, Debug, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ReflowError {
    #[error("Process instance not found: {0}")]
    ProcessNotFound(String),

    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{task_id}' failed: {message}")]
    TaskExecution {
        task_id: String,
        message: String,
        /// Rendered original cause, kept as text so the error stays `Clone`
        cause: Option<String>,
    },

    #[error("Task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow '{flow_id}' timed out after {timeout_ms}ms")]
    FlowTimeout { flow_id: String, timeout_ms: u64 },
}

impl ReflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReflowError::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
            ReflowError::ProcessDefinitionNotFound(_) => ErrorKind::ProcessDefinitionNotFound,
            ReflowError::TaskNotFound(_) => ErrorKind::TaskNotFound,
            ReflowError::TaskExecution { .. } => ErrorKind::TaskExecutionError,
            ReflowError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            ReflowError::InvalidTransition(_) => ErrorKind::InvalidTransition,
            ReflowError::Validation(_) => ErrorKind::ValidationError,
            ReflowError::Storage(_) => ErrorKind::StorageError,
            ReflowError::Plugin(_) => ErrorKind::PluginError,
            ReflowError::Unknown(_) => ErrorKind::UnknownError,
            ReflowError::FlowNotFound(_) => ErrorKind::FlowNotFound,
            ReflowError::FlowTimeout { .. } => ErrorKind::FlowTimeout,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ReflowError::Validation(message.into())
    }

    /// A task failure with no more specific classification
    pub fn task_failed(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        ReflowError::TaskExecution {
            task_id: task_id.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TaskExecutionError
                | ErrorKind::TaskTimeout
                | ErrorKind::StorageError
                | ErrorKind::PluginError
                | ErrorKind::UnknownError
        )
    }

    /// Re-tag a failure as a task execution error unless it already carries
    /// a more specific kind.
    pub fn into_task_error(self, task_id: &str) -> Self {
        match self {
            ReflowError::Unknown(message) => ReflowError::TaskExecution {
                task_id: task_id.to_string(),
                message: message.clone(),
                cause: Some(message),
            },
            other => other,
        }
    }
}

/// Result type alias for Reflow operations
pub type ReflowResult<T> = Result<T, ReflowError>;
