//! Persistent queue state.
//!
//! All entities live in an in-memory typed state behind one write lock; each
//! successful mutation is persisted by serializing the affected documents to
//! a sibling `.tmp` file and renaming. Readers never observe a torn write,
//! and a failed mutation leaves both memory and disk untouched.

use crate::agents::registry::{AgentRecord, OrchestratorRecord};
use crate::tasks::task::{AsyncOperation, Batch, Task, TaskStatus};
use crate::utils::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// `task_queue.json`: tasks, terminal history, batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDocument {
    pub tasks: Vec<Task>,
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
    pub batches: Vec<Batch>,
}

impl QueueDocument {
    #[must_use]
    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Mutable lookup that reports an unknown id as a typed error.
    pub fn task_mut(&mut self, id: &str) -> OrchestratorResult<&mut Task> {
        self.find_task_mut(id)
            .ok_or_else(|| OrchestratorError::TaskNotFound { id: id.to_string() })
    }

    #[must_use]
    pub fn find_batch(&self, id: &str) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    pub fn batch_mut(&mut self, id: &str) -> OrchestratorResult<&mut Batch> {
        self.batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| OrchestratorError::BatchNotFound { id: id.to_string() })
    }

    /// Move a live task into the completed history.
    pub fn move_to_completed(&mut self, id: &str) -> OrchestratorResult<()> {
        let pos = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| OrchestratorError::TaskNotFound { id: id.to_string() })?;
        let task = self.tasks.remove(pos);
        self.completed.push(task);
        Ok(())
    }

    /// Move a live task into the failed history.
    pub fn move_to_failed(&mut self, id: &str) -> OrchestratorResult<()> {
        let pos = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| OrchestratorError::TaskNotFound { id: id.to_string() })?;
        let task = self.tasks.remove(pos);
        self.failed.push(task);
        Ok(())
    }

    /// Count of live tasks in a given status.
    #[must_use]
    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// In-flight tasks currently held by an agent.
    #[must_use]
    pub fn agent_load(&self, agent: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| {
                t.assigned_agent.as_deref() == Some(agent)
                    && matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress)
            })
            .count()
    }

    /// Whether a dependency id has completed successfully.
    #[must_use]
    pub fn dependency_met(&self, dep_id: &str) -> bool {
        self.completed.iter().any(|t| t.id == dep_id)
    }
}

/// `agent_status.json`: per-agent records plus the supervisor's own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDocument {
    pub agents: HashMap<String, AgentRecord>,
    pub orchestrator: OrchestratorRecord,
}

/// Metadata block of `queue_analytics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsMetadata {
    pub created: i64,
    pub last_pruned: i64,
}

/// One appended analytics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsMetric {
    pub timestamp: i64,
    pub queued: usize,
    pub blocked: usize,
    pub in_progress: usize,
    pub retry_scheduled: usize,
    pub completed_total: usize,
    pub failed_total: usize,
    pub agent_utilization: HashMap<String, f64>,
    pub task_type_distribution: HashMap<String, u64>,
    pub avg_completion_secs: f64,
    pub throughput_per_hour: f64,
    pub failure_rate: f64,
}

/// `queue_analytics.json`: append-only metric history with pruning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsDocument {
    pub metadata: AnalyticsMetadata,
    pub metrics: Vec<AnalyticsMetric>,
}

/// `async_operations.json`: current and recently finished async dispatches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsyncDocument {
    pub operations: Vec<AsyncOperation>,
}

/// The whole logical state owned by the store.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    pub queue: QueueDocument,
    pub agents: AgentDocument,
    pub analytics: AnalyticsDocument,
    pub async_ops: AsyncDocument,
}

const QUEUE_FILE: &str = "task_queue.json";
const AGENTS_FILE: &str = "agent_status.json";
const ANALYTICS_FILE: &str = "queue_analytics.json";
const ASYNC_FILE: &str = "async_operations.json";

/// Durable store for all orchestrator entities.
///
/// The single write lock is the serialization point for every mutation from
/// the scheduler, queue manager and supervisor loop.
pub struct QueueStore {
    data_dir: PathBuf,
    state: RwLock<StoreState>,
    task_seq: AtomicU64,
}

impl QueueStore {
    /// Open the store, loading any existing documents from `data_dir`.
    ///
    /// Missing files mean a fresh state; parse errors propagate so a corrupt
    /// store is never silently replaced.
    pub async fn open(data_dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(OrchestratorError::store)?;

        let state = StoreState {
            queue: load_document(&data_dir.join(QUEUE_FILE)).await?,
            agents: load_document(&data_dir.join(AGENTS_FILE)).await?,
            analytics: load_document(&data_dir.join(ANALYTICS_FILE)).await?,
            async_ops: load_document(&data_dir.join(ASYNC_FILE)).await?,
        };

        // Seed the id counter past anything already stored.
        let max_seq = state
            .queue
            .tasks
            .iter()
            .chain(&state.queue.completed)
            .chain(&state.queue.failed)
            .filter_map(|t| t.id.rsplit('_').next()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        debug!(dir = %data_dir.display(), tasks = state.queue.tasks.len(), "store opened");

        Ok(Self {
            data_dir,
            state: RwLock::new(state),
            task_seq: AtomicU64::new(max_seq + 1),
        })
    }

    /// Generate the next task id.
    pub fn next_task_id(&self, now: i64) -> String {
        let seq = self.task_seq.fetch_add(1, Ordering::SeqCst);
        format!("task_{now}_{seq}")
    }

    /// Read-only snapshot of the full state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    /// Apply a transformation atomically.
    ///
    /// The closure runs against a working copy; only when it succeeds and
    /// the snapshot reaches disk does the copy become the current state.
    pub async fn mutate<T, F>(&self, f: F) -> OrchestratorResult<T>
    where
        F: FnOnce(&mut StoreState) -> OrchestratorResult<T>,
    {
        let mut guard = self.state.write().await;
        let mut working = guard.clone();
        let out = f(&mut working)?;
        self.persist(&working).await?;
        *guard = working;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> OrchestratorResult<()> {
        write_document(&self.data_dir.join(QUEUE_FILE), &state.queue).await?;
        write_document(&self.data_dir.join(AGENTS_FILE), &state.agents).await?;
        write_document(&self.data_dir.join(ANALYTICS_FILE), &state.analytics).await?;
        write_document(&self.data_dir.join(ASYNC_FILE), &state.async_ops).await?;
        Ok(())
    }

    /// Path of the primary queue document, used by the self-check.
    #[must_use]
    pub fn queue_file(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    /// Path of the agent status document, used by the self-check.
    #[must_use]
    pub fn agents_file(&self) -> PathBuf {
        self.data_dir.join(AGENTS_FILE)
    }

    // ------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------

    pub async fn add_task(&self, task: Task) -> OrchestratorResult<()> {
        self.mutate(|state| {
            state.queue.tasks.push(task);
            Ok(())
        })
        .await
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> OrchestratorResult<()> {
        self.mutate(|state| {
            state.queue.task_mut(id)?.status = status;
            Ok(())
        })
        .await
    }

    pub async fn append_completed(&self, id: &str, now: i64) -> OrchestratorResult<()> {
        self.mutate(|state| {
            let task = state.queue.task_mut(id)?;
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            state.queue.move_to_completed(id)
        })
        .await
    }

    pub async fn append_failed(&self, id: &str, reason: &str, now: i64) -> OrchestratorResult<()> {
        self.mutate(|state| {
            let task = state.queue.task_mut(id)?;
            task.status = TaskStatus::Failed;
            task.failed_at = Some(now);
            task.last_error = Some(reason.to_string());
            state.queue.move_to_failed(id)
        })
        .await
    }

    pub async fn add_batch(&self, batch: Batch) -> OrchestratorResult<()> {
        self.mutate(|state| {
            state.queue.batches.push(batch);
            Ok(())
        })
        .await
    }

    pub async fn update_batch<F>(&self, id: &str, f: F) -> OrchestratorResult<()>
    where
        F: FnOnce(&mut Batch),
    {
        self.mutate(|state| {
            f(state.queue.batch_mut(id)?);
            Ok(())
        })
        .await
    }

    pub async fn append_metric(&self, metric: AnalyticsMetric) -> OrchestratorResult<()> {
        self.mutate(|state| {
            state.analytics.metrics.push(metric);
            Ok(())
        })
        .await
    }

    pub async fn get_agent_record(&self, name: &str) -> Option<AgentRecord> {
        self.state.read().await.agents.agents.get(name).cloned()
    }

    pub async fn set_agent_record(&self, record: AgentRecord) -> OrchestratorResult<()> {
        self.mutate(|state| {
            state.agents.agents.insert(record.name.clone(), record);
            Ok(())
        })
        .await
    }
}

async fn load_document<T>(path: &Path) -> OrchestratorResult<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| OrchestratorError::StoreError {
            reason: format!("failed to parse {}: {e}", path.display()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(OrchestratorError::StoreError {
            reason: format!("failed to read {}: {e}", path.display()),
        }),
    }
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> OrchestratorResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| OrchestratorError::StoreError {
        reason: format!("failed to serialize {}: {e}", path.display()),
    })?;

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = fs::write(&tmp, &json).await {
        // remove whatever partial artifact exists before reporting
        if let Err(cleanup) = fs::remove_file(&tmp).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temp artifact");
            }
        }
        return Err(OrchestratorError::StoreError {
            reason: format!("failed to write {}: {e}", tmp.display()),
        });
    }

    fs::rename(&tmp, path)
        .await
        .map_err(|e| OrchestratorError::StoreError {
            reason: format!("failed to rename {} into place: {e}", tmp.display()),
        })
}
