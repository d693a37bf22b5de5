//! Admission control and queue maintenance.
//!
//! New tasks pass capacity checks and duplicate detection before entering
//! the queue; recognized workflow types atomically grow their chain. The
//! maintenance passes enforce size caps, expire stale queued tasks, bound
//! terminal history, and archive old completed tasks to compressed files.

use crate::core::scheduler::workflow;
use crate::infrastructure::persistence::{QueueStore, StoreState};
use crate::tasks::compression;
use crate::tasks::similarity::word_jaccard;
use crate::tasks::task::{Task, TaskRequest, TaskStatus};
use crate::utils::config::OrchestratorConfig;
use crate::utils::error::{OrchestratorError, OrchestratorResult};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Result of an admission attempt. Rejections are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted {
        task_id: String,
        /// Ids of blocked chain tasks created behind the seed.
        chained: Vec<String>,
    },
    RejectedDuplicate {
        existing_id: String,
        reason: String,
    },
    RejectedCapacity {
        reason: String,
    },
}

impl AdmissionOutcome {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Admission, retention and storage-optimization policy.
pub struct QueueManager {
    config: Arc<OrchestratorConfig>,
    store: Arc<QueueStore>,
    archive_dir: PathBuf,
}

impl QueueManager {
    #[must_use]
    pub fn new(config: Arc<OrchestratorConfig>, store: Arc<QueueStore>) -> Self {
        let archive_dir = config.paths.data_dir.join("archive");
        Self {
            config,
            store,
            archive_dir,
        }
    }

    /// Admit a task request, creating its workflow chain atomically.
    pub async fn admit(&self, request: TaskRequest, now: i64) -> OrchestratorResult<AdmissionOutcome> {
        if request.description.trim().is_empty() {
            return Err(OrchestratorError::OperationFailed {
                reason: "task description cannot be empty".to_string(),
            });
        }

        let config = self.config.clone();
        let seed_id = self.store.next_task_id(now);
        let store = self.store.clone();
        // chain ids must come from the same counter; pre-generate a handful
        let chain_len = workflow::chain_for(&request.task_type)
            .map(|c| c.len().saturating_sub(1))
            .unwrap_or(0);
        let chain_ids: Vec<String> = (0..chain_len).map(|_| store.next_task_id(now)).collect();

        self.store
            .mutate(move |state| {
                if let Some(rejection) = check_duplicate(state, &request, &config, now) {
                    return Ok(rejection);
                }
                if let Some(rejection) = check_capacity(state, &config) {
                    return Ok(rejection);
                }

                let description =
                    compression::maybe_compress(&request.description, config.compression.threshold)?;
                let task = Task::new(
                    seed_id.clone(),
                    request.task_type.clone(),
                    description,
                    request.priority,
                    now,
                )
                .with_agent(request.agent.clone())
                .with_dependencies(request.dependencies.clone());

                state.queue.tasks.push(task.clone());

                let mut pending = chain_ids.clone().into_iter();
                let mut next_id = move || pending.next().unwrap_or_default();
                let chained = workflow::expand_chain(&mut state.queue, &task, now, &mut next_id);

                debug!(task_id = %seed_id, task_type = %request.task_type, chained = chained.len(), "task admitted");
                Ok(AdmissionOutcome::Admitted {
                    task_id: seed_id,
                    chained,
                })
            })
            .await
    }

    /// Enforce queue caps and expire stale queued tasks.
    ///
    /// Returns how many tasks were removed.
    pub async fn enforce_limits(&self, now: i64) -> OrchestratorResult<usize> {
        let config = self.config.clone();
        self.store
            .mutate(move |state| {
                let mut removed = 0;

                // expire queued tasks past their lifetime
                let expiration = config.queue.task_expiration_hours * 3600;
                let before = state.queue.tasks.len();
                state.queue.tasks.retain(|t| {
                    let expired =
                        t.status == TaskStatus::Queued && now - t.created > expiration;
                    if expired {
                        warn!(task_id = %t.id, "queued task expired");
                    }
                    !expired
                });
                removed += before - state.queue.tasks.len();

                // trim lowest-priority, oldest tasks over the hard cap
                while state.queue.tasks.len() > config.queue.max_queue_size {
                    let victim = state
                        .queue
                        .tasks
                        .iter()
                        .filter(|t| {
                            matches!(t.status, TaskStatus::Queued | TaskStatus::Blocked)
                        })
                        .min_by(|a, b| a.priority.cmp(&b.priority).then(a.created.cmp(&b.created)))
                        .map(|t| t.id.clone());
                    let Some(id) = victim else {
                        break;
                    };
                    warn!(task_id = %id, "task trimmed over queue hard cap");
                    state.queue.tasks.retain(|t| t.id != id);
                    removed += 1;
                }

                // admission caps queued intake, but unblocking can still
                // push the queued population over the limit
                while state.queue.count_status(TaskStatus::Queued)
                    > config.queue.max_queued_tasks
                {
                    let victim = state
                        .queue
                        .tasks
                        .iter()
                        .filter(|t| t.status == TaskStatus::Queued)
                        .min_by(|a, b| a.priority.cmp(&b.priority).then(a.created.cmp(&b.created)))
                        .map(|t| t.id.clone());
                    let Some(id) = victim else {
                        break;
                    };
                    warn!(task_id = %id, "queued task trimmed over admission cap");
                    state.queue.tasks.retain(|t| t.id != id);
                    removed += 1;
                }

                Ok(removed)
            })
            .await
    }

    /// Bound terminal history by count and age.
    pub async fn apply_retention(&self, now: i64) -> OrchestratorResult<usize> {
        let config = self.config.clone();
        self.store
            .mutate(move |state| {
                let cutoff = now - config.queue.task_retention_days * 24 * 3600;
                let mut removed = 0;
                removed += trim_history(
                    &mut state.queue.completed,
                    config.queue.max_completed_history,
                    cutoff,
                );
                removed += trim_history(
                    &mut state.queue.failed,
                    config.queue.max_completed_history,
                    cutoff,
                );
                Ok(removed)
            })
            .await
    }

    /// Compress long descriptions in place and archive old completed tasks.
    pub async fn optimize_storage(&self, now: i64) -> OrchestratorResult<()> {
        let config = self.config.clone();
        let archived: Vec<Task> = self
            .store
            .mutate(move |state| {
                compress_stored_descriptions(state, config.compression.threshold)?;

                let cutoff = now - config.compression.retention_days * 24 * 3600;
                let (old, keep): (Vec<Task>, Vec<Task>) = state
                    .queue
                    .completed
                    .drain(..)
                    .partition(|t| t.completed_at.unwrap_or(t.created) < cutoff);
                state.queue.completed = keep;
                Ok(old)
            })
            .await?;

        if !archived.is_empty() {
            self.write_archive(&archived, now).await?;
            info!(count = archived.len(), "completed tasks archived");
        }
        self.prune_archives().await?;
        Ok(())
    }

    async fn write_archive(&self, tasks: &[Task], now: i64) -> OrchestratorResult<()> {
        fs::create_dir_all(&self.archive_dir)
            .await
            .map_err(OrchestratorError::store)?;

        let json = serde_json::to_vec_pretty(tasks).map_err(OrchestratorError::store)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(OrchestratorError::store)?;
        let compressed = encoder.finish().map_err(OrchestratorError::store)?;

        let path = self.archive_dir.join(format!("completed_{now}.json.gz"));
        fs::write(&path, compressed)
            .await
            .map_err(OrchestratorError::store)?;
        Ok(())
    }

    async fn prune_archives(&self) -> OrchestratorResult<()> {
        let mut entries = match fs::read_dir(&self.archive_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(OrchestratorError::store(e)),
        };

        let mut archives: Vec<PathBuf> = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(OrchestratorError::store)? {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("completed_") && n.ends_with(".json.gz"))
            {
                archives.push(path);
            }
        }

        // newest first by the embedded timestamp in the file name
        archives.sort();
        archives.reverse();
        for stale in archives.iter().skip(self.config.compression.max_archive_files) {
            if let Err(e) = fs::remove_file(stale).await {
                warn!(path = %stale.display(), error = %e, "failed to prune archive");
            }
        }
        Ok(())
    }
}

fn trim_history(history: &mut Vec<Task>, max_count: usize, age_cutoff: i64) -> usize {
    let before = history.len();
    history.retain(|t| {
        t.completed_at
            .or(t.failed_at)
            .unwrap_or(t.created)
            >= age_cutoff
    });
    if history.len() > max_count {
        let excess = history.len() - max_count;
        history.drain(..excess);
    }
    before - history.len()
}

fn compress_stored_descriptions(state: &mut StoreState, threshold: usize) -> OrchestratorResult<()> {
    for task in &mut state.queue.tasks {
        if task.description.len() > threshold
            && !task.description.starts_with(compression::COMPRESSED_PREFIX)
        {
            task.description = compression::compress(&task.description)?;
        }
    }
    Ok(())
}

fn plain_description(task: &Task) -> String {
    compression::decompress(&task.description).unwrap_or_else(|_| task.description.clone())
}

fn is_restart_task(task_type: &str, description: &str) -> bool {
    task_type.contains("restart") || description.to_lowercase().contains("restart")
}

fn is_monitor_task(task_type: &str, description: &str) -> bool {
    let lower = description.to_lowercase();
    matches!(task_type, "health" | "monitor")
        || lower.contains("health check")
        || lower.contains("monitor")
}

fn check_capacity(state: &StoreState, config: &OrchestratorConfig) -> Option<AdmissionOutcome> {
    let queued = state.queue.count_status(TaskStatus::Queued);
    if queued >= config.queue.max_queued_tasks {
        return Some(AdmissionOutcome::RejectedCapacity {
            reason: format!("queued task limit reached ({queued})"),
        });
    }
    let total = state.queue.tasks.len();
    if total >= config.queue.max_queue_size {
        return Some(AdmissionOutcome::RejectedCapacity {
            reason: format!("queue size limit reached ({total})"),
        });
    }
    None
}

fn check_duplicate(
    state: &StoreState,
    request: &TaskRequest,
    config: &OrchestratorConfig,
    now: i64,
) -> Option<AdmissionOutcome> {
    let window = config.queue.dedup_window_hours * 3600;
    let new_description = request.description.to_lowercase();
    let new_is_restart = is_restart_task(&request.task_type, &request.description);
    let new_is_monitor = is_monitor_task(&request.task_type, &request.description);

    let recent = |task: &Task| now - task.created <= window;
    let candidates = state
        .queue
        .tasks
        .iter()
        .map(|t| (t, true))
        .chain(state.queue.completed.iter().map(|t| (t, false)))
        .chain(state.queue.failed.iter().map(|t| (t, false)));

    let mut monitor_count = 0usize;

    for (task, in_flight) in candidates {
        let considered = in_flight || recent(task);
        if !considered {
            continue;
        }
        let existing_description = plain_description(task);

        // exact duplicate by type and description
        if task.task_type == request.task_type
            && existing_description.eq_ignore_ascii_case(&request.description)
        {
            return Some(AdmissionOutcome::RejectedDuplicate {
                existing_id: task.id.clone(),
                reason: "exact duplicate".to_string(),
            });
        }

        // near duplicate within the window
        if task.task_type == request.task_type && recent(task) {
            let similarity = word_jaccard(&existing_description, &new_description);
            if similarity >= config.queue.dedup_similarity_threshold {
                return Some(AdmissionOutcome::RejectedDuplicate {
                    existing_id: task.id.clone(),
                    reason: format!("near duplicate (similarity {similarity:.2})"),
                });
            }
        }

        // any restart task collides with any other restart task
        if new_is_restart
            && recent(task)
            && is_restart_task(&task.task_type, &existing_description)
        {
            return Some(AdmissionOutcome::RejectedDuplicate {
                existing_id: task.id.clone(),
                reason: "restart task already pending in window".to_string(),
            });
        }

        if recent(task) && is_monitor_task(&task.task_type, &existing_description) {
            monitor_count += 1;
        }
    }

    if new_is_monitor && monitor_count >= config.queue.monitor_task_cap {
        return Some(AdmissionOutcome::RejectedDuplicate {
            existing_id: String::new(),
            reason: format!(
                "monitor task cap of {} reached in window",
                config.queue.monitor_task_cap
            ),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager_with_store() -> (TempDir, QueueManager, Arc<QueueStore>) {
        let dir = TempDir::new().unwrap();
        let mut config = OrchestratorConfig::default();
        config.paths.data_dir = dir.path().to_path_buf();
        let config = Arc::new(config);
        let store = Arc::new(QueueStore::open(dir.path()).await.unwrap());
        let manager = QueueManager::new(config, store.clone());
        (dir, manager, store)
    }

    fn request(task_type: &str, description: &str, priority: u8) -> TaskRequest {
        TaskRequest {
            task_type: task_type.to_string(),
            description: description.to_string(),
            priority,
            agent: None,
            dependencies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_admission_yields_one_task() {
        let (_dir, manager, store) = manager_with_store().await;
        let now = 10_000;

        let first = manager
            .admit(request("docs", "Write release notes for v2", 5), now)
            .await
            .unwrap();
        assert!(first.is_admitted());

        let second = manager
            .admit(request("docs", "Write release notes for v2", 5), now + 30)
            .await
            .unwrap();
        assert!(matches!(
            second,
            AdmissionOutcome::RejectedDuplicate { .. }
        ));

        let state = store.snapshot().await;
        assert_eq!(state.queue.tasks.len(), 1);
    }

    #[tokio::test]
    async fn near_duplicates_are_rejected() {
        let (_dir, manager, _store) = manager_with_store().await;
        let now = 10_000;

        manager
            .admit(
                request("docs", "summarize the deployment checklist for review", 5),
                now,
            )
            .await
            .unwrap();
        let outcome = manager
            .admit(
                request("docs", "summarize the deployment checklist for approval", 5),
                now + 60,
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AdmissionOutcome::RejectedDuplicate { .. }
        ));
    }

    #[tokio::test]
    async fn different_types_are_not_duplicates() {
        let (_dir, manager, _store) = manager_with_store().await;
        let now = 10_000;

        manager
            .admit(request("docs", "summarize deployment checklist", 5), now)
            .await
            .unwrap();
        let outcome = manager
            .admit(request("review", "summarize deployment checklist", 5), now)
            .await
            .unwrap();
        assert!(outcome.is_admitted());
    }

    #[tokio::test]
    async fn workflow_admission_creates_chain() {
        let (_dir, manager, store) = manager_with_store().await;
        let now = 10_000;

        let outcome = manager
            .admit(request("debug", "Fix crash in module X", 8), now)
            .await
            .unwrap();
        let AdmissionOutcome::Admitted { task_id, chained } = outcome else {
            panic!("expected admission");
        };
        assert_eq!(chained.len(), 2);

        let state = store.snapshot().await;
        assert_eq!(state.queue.tasks.len(), 3);

        let seed = state.queue.find_task(&task_id).unwrap();
        assert_eq!(seed.status, TaskStatus::Queued);

        let test_task = state.queue.find_task(&chained[0]).unwrap();
        assert_eq!(test_task.task_type, "test");
        assert_eq!(test_task.priority, 7);
        assert_eq!(test_task.status, TaskStatus::Blocked);
        assert_eq!(test_task.dependencies, vec![task_id.clone()]);

        let build_task = state.queue.find_task(&chained[1]).unwrap();
        assert_eq!(build_task.task_type, "build");
        assert_eq!(build_task.priority, 6);
        assert_eq!(build_task.dependencies, vec![chained[0].clone()]);
    }

    #[tokio::test]
    async fn restart_tasks_dedupe_across_descriptions() {
        let (_dir, manager, _store) = manager_with_store().await;
        let now = 10_000;

        manager
            .admit(request("restart", "Restart agent_build process", 7), now)
            .await
            .unwrap();
        let outcome = manager
            .admit(request("restart", "Restart agent_docs process", 7), now + 60)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AdmissionOutcome::RejectedDuplicate { .. }
        ));
    }

    #[tokio::test]
    async fn monitor_tasks_cap_at_two_per_window() {
        let (_dir, manager, _store) = manager_with_store().await;
        let now = 10_000;

        assert!(manager
            .admit(request("monitor", "Check queue depth alpha", 4), now)
            .await
            .unwrap()
            .is_admitted());
        assert!(manager
            .admit(request("monitor", "Probe agent liveness beta", 4), now + 10)
            .await
            .unwrap()
            .is_admitted());
        let third = manager
            .admit(request("monitor", "Inspect disk headroom gamma", 4), now + 20)
            .await
            .unwrap();
        assert!(matches!(third, AdmissionOutcome::RejectedDuplicate { .. }));
    }

    #[tokio::test]
    async fn queued_capacity_rejects_admission() {
        let (_dir, manager, _store) = {
            let dir = TempDir::new().unwrap();
            let mut config = OrchestratorConfig::default();
            config.paths.data_dir = dir.path().to_path_buf();
            config.queue.max_queued_tasks = 2;
            let store = Arc::new(QueueStore::open(dir.path()).await.unwrap());
            let manager = QueueManager::new(Arc::new(config), store.clone());
            (dir, manager, store)
        };
        let now = 10_000;

        assert!(manager
            .admit(request("docs", "first distinct description alpha", 5), now)
            .await
            .unwrap()
            .is_admitted());
        assert!(manager
            .admit(request("build", "second distinct description beta", 5), now)
            .await
            .unwrap()
            .is_admitted());
        let outcome = manager
            .admit(request("review", "third distinct description gamma", 5), now)
            .await
            .unwrap();
        assert!(matches!(outcome, AdmissionOutcome::RejectedCapacity { .. }));
    }

    #[tokio::test]
    async fn long_descriptions_are_stored_compressed() {
        let (_dir, manager, store) = manager_with_store().await;
        let description = format!("Investigate slow startup. {}", "details ".repeat(100));

        let outcome = manager
            .admit(request("analyze", &description, 5), 10_000)
            .await
            .unwrap();
        let AdmissionOutcome::Admitted { task_id, .. } = outcome else {
            panic!("expected admission");
        };

        let state = store.snapshot().await;
        let stored = &state.queue.find_task(&task_id).unwrap().description;
        assert!(stored.starts_with(compression::COMPRESSED_PREFIX));
        assert_eq!(compression::decompress(stored).unwrap(), description);
    }

    #[tokio::test]
    async fn expired_queued_tasks_are_removed() {
        let (_dir, manager, store) = manager_with_store().await;
        let now = 200_000;

        manager
            .admit(request("docs", "stale queued description", 5), now - 30 * 3600)
            .await
            .unwrap();
        manager
            .admit(request("build", "fresh queued description", 5), now - 3600)
            .await
            .unwrap();

        let removed = manager.enforce_limits(now).await.unwrap();
        assert_eq!(removed, 1);
        let state = store.snapshot().await;
        assert_eq!(state.queue.tasks.len(), 1);
        assert_eq!(state.queue.tasks[0].task_type, "build");
    }

    #[tokio::test]
    async fn retention_bounds_history() {
        let (_dir, manager, store) = manager_with_store().await;
        let now = 10_000_000;

        store
            .mutate(|state| {
                for i in 0..5 {
                    let mut task = Task::new(
                        format!("task_1_{i}"),
                        "docs".to_string(),
                        format!("description {i}"),
                        5,
                        now - 1000,
                    );
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now - 1000);
                    state.queue.completed.push(task);
                }
                // one ancient entry past the age cutoff
                let mut old = Task::new(
                    "task_0_0".to_string(),
                    "docs".to_string(),
                    "ancient description".to_string(),
                    5,
                    1_000,
                );
                old.status = TaskStatus::Completed;
                old.completed_at = Some(1_000);
                state.queue.completed.push(old);
                Ok(())
            })
            .await
            .unwrap();

        let removed = manager.apply_retention(now).await.unwrap();
        assert_eq!(removed, 1);
        let state = store.snapshot().await;
        assert!(state.queue.completed.iter().all(|t| t.id != "task_0_0"));
    }
}
