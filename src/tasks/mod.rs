//! Task model, admission control and storage policy.

/// Description compression and archival helpers
pub mod compression;
/// Admission, retention and storage optimization
pub mod queue;
/// Word-set similarity used by dedup and batching
pub mod similarity;
/// Core task, batch and async-operation records
pub mod task;

pub use queue::{AdmissionOutcome, QueueManager};
pub use task::{AsyncOpStatus, AsyncOperation, Batch, BatchStatus, Task, TaskRequest, TaskStatus};
