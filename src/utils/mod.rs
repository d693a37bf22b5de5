/// Configuration loading and validation
pub mod config;
/// Error types shared across the orchestrator
pub mod error;

pub use config::{AgentDefinition, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult};

/// Current time as Unix seconds, the timestamp unit of every persisted record.
#[must_use]
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
