use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task through its lifecycle.
///
/// Transitions are monotonic: `Queued` -> (`Blocked` | `Assigned`) ->
/// `InProgress` -> (`Completed` | `Failed` | `RetryScheduled`), with
/// `RetryScheduled` -> `Queued` allowed. A task whose dependency fails is
/// `Cancelled` and recorded as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Blocked,
    Assigned,
    InProgress,
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// True for states a task never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A unit of work dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    /// Base priority, 1-10. Effective priority is recomputed per tick.
    pub priority: u8,
    pub status: TaskStatus,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new(id: String, task_type: String, description: String, priority: u8, created: i64) -> Self {
        Self {
            id,
            task_type,
            description,
            priority: priority.clamp(1, 10),
            status: TaskStatus::Queued,
            created,
            assigned_agent: None,
            dependencies: Vec::new(),
            workflow_type: None,
            step_number: None,
            parent_task_id: None,
            retry_count: 0,
            retry_at: None,
            last_error: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            batch_id: None,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        if !dependencies.is_empty() {
            self.status = TaskStatus::Blocked;
        }
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.assigned_agent = agent;
        self
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow_type: String, step: u32, parent: String) -> Self {
        self.workflow_type = Some(workflow_type);
        self.step_number = Some(step);
        self.parent_task_id = Some(parent);
        self
    }

    /// Age of the task in seconds at `now`.
    #[must_use]
    pub fn age_secs(&self, now: i64) -> i64 {
        (now - self.created).max(0)
    }
}

/// Status of a batch of similar tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Assigned,
    Completed,
}

/// A coherent group of similar tasks dispatched together to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub agent: String,
    pub task_ids: Vec<String>,
    /// Max of the member tasks' effective priorities at creation.
    pub priority: u8,
    pub status: BatchStatus,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl Batch {
    #[must_use]
    pub fn new(agent: String, task_ids: Vec<String>, priority: u8, created: i64) -> Self {
        Self {
            id: format!("batch_{}", Uuid::new_v4()),
            agent,
            task_ids,
            priority,
            status: BatchStatus::Active,
            created,
            assigned_at: None,
            completed_at: None,
            success: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncOpStatus {
    Running,
    Completed,
    Failed,
}

/// Record of an in-flight asynchronous dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncOperation {
    pub id: String,
    pub task_id: String,
    pub agent: String,
    pub status: AsyncOpStatus,
    pub started_at: i64,
    pub timeout_at: i64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl AsyncOperation {
    #[must_use]
    pub fn new(task_id: String, agent: String, started_at: i64, timeout_secs: i64) -> Self {
        Self {
            id: format!("async_{}", Uuid::new_v4()),
            task_id,
            agent,
            status: AsyncOpStatus::Running,
            started_at,
            timeout_at: started_at + timeout_secs,
            retry_count: 0,
            final_status: None,
            error_reason: None,
        }
    }
}

/// Incoming request for a new task, before admission control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_priority() -> u8 {
    5
}
