//! Agent records and process control.

/// Launching, probing and terminating agent processes
pub mod process;
/// Persistent per-agent runtime records
pub mod registry;

pub use process::ProcessManager;
pub use registry::{AgentHealth, AgentRecord, AgentStatus, HealthState, PerformanceEntry};
