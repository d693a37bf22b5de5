//! # Task Orchestrator
//!
//! A multi-agent task orchestrator: a long-running supervisor that keeps a
//! fleet of worker processes alive, admits and deduplicates tasks, tracks
//! dependencies and workflow chains, batches and dispatches work, retries
//! transient failures with backoff, throttles under host resource
//! pressure, and reports analytics.
//!
//! ## Architecture Overview
//!
//! - [`tasks`]: task model, admission control and storage policy
//! - [`agents`]: agent records and process control
//! - [`communication`]: file-based supervisor/agent message passing
//! - [`core`]: scheduling and the supervisor loop
//! - [`infrastructure`]: persistence, health, resources and analytics
//! - [`api`]: the optional HTTP status surface
//! - [`utils`]: configuration and error handling

/// Agent records and process control
pub mod agents;
/// Optional HTTP status surface
pub mod api;
/// Supervisor/agent message passing
pub mod communication;
/// Scheduling and the supervisor loop
pub mod core;
/// Persistence, health, resources and analytics
pub mod infrastructure;
/// Task model and queue policy
pub mod tasks;
/// Configuration and error handling
pub mod utils;

/// Unit tests exercising cross-component scenarios
#[cfg(test)]
mod tests;

pub use agents::{AgentRecord, AgentStatus, ProcessManager};
pub use communication::{AgentEvent, FileTransport, InboundEvent, Transport};
pub use core::{Scheduler, Supervisor};
pub use infrastructure::{AnalyticsCollector, HealthMonitor, QueueStore, RuntimeLimits};
pub use tasks::{AdmissionOutcome, QueueManager, Task, TaskRequest, TaskStatus};
pub use utils::{OrchestratorConfig, OrchestratorError, OrchestratorResult};
