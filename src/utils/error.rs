use thiserror::Error;

/// Error types for the task orchestrator.
///
/// Covers every failure class the components report: store mutations,
/// transport I/O, admission rejections that escalate to errors, process
/// control, and configuration problems.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Task-related errors
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Batch not found: {id}")]
    BatchNotFound { id: String },

    #[error("Agent not found: {name}")]
    AgentNotFound { name: String },

    /// Admission errors
    #[error("Queue full: {reason}")]
    QueueFull { reason: String },

    #[error("Duplicate task: {reason}")]
    DuplicateTask { reason: String },

    #[error("Concurrency limit reached for agent {agent}: {limit}")]
    ConcurrencyLimit { agent: String, limit: usize },

    /// Store errors abort the single mutation and leave state untouched
    #[error("Store error: {reason}")]
    StoreError { reason: String },

    /// Transport errors
    #[error("Transport error: {reason}")]
    TransportError { reason: String },

    /// Configuration errors
    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },

    /// Agent process control errors
    #[error("Process error for agent {agent}: {reason}")]
    ProcessError { agent: String, reason: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Circuit breaker open for agent {agent}")]
    CircuitBreakerOpen { agent: String },

    #[error("Operation failed: {reason}")]
    OperationFailed { reason: String },
}

/// Result type alias used across the orchestrator
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Build a store error from any displayable cause.
    pub fn store(cause: impl std::fmt::Display) -> Self {
        Self::StoreError {
            reason: cause.to_string(),
        }
    }

    /// Build a transport error from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::TransportError {
            reason: cause.to_string(),
        }
    }
}
