use thiserror::Error;

/// Core error type for the Trestle engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow definition not found for the requested revision
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Execution not found
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Task referenced by a task run is missing from its flow
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task run not found within an execution
    #[error("Task run not found: {0}")]
    TaskRunNotFound(String),

    /// Flow definition validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
