//! Dispatch planning.
//!
//! Each tick dispatches up to `MAX_BATCHES_PER_CYCLE` batches and then
//! remaining individual tasks, critical work first. With async processing
//! enabled, tasks instead open `AsyncOperation` records up to the throttled
//! per-agent concurrency cap; excess stays queued for a later pass.
//!
//! Planning happens inside a store mutation; the returned plans tell the
//! supervisor which transport events to emit afterwards.

use crate::core::scheduler::priority::{effective_priority, is_critical};
use crate::core::scheduler::selection::{select_agent, AgentCandidate};
use crate::infrastructure::persistence::{QueueDocument, StoreState};
use crate::infrastructure::resource_monitor::{can_start_task, ResourceSnapshot};
use crate::tasks::task::{AsyncOpStatus, AsyncOperation, BatchStatus, TaskStatus};
use crate::utils::config::OrchestratorConfig;
use std::collections::HashMap;
use tracing::debug;

/// One batch marked for dispatch this cycle.
#[derive(Debug, Clone)]
pub struct PlannedBatchDispatch {
    pub batch_id: String,
    pub agent: String,
    /// Member task ids with a flag marking re-dispatch after a retry.
    pub tasks: Vec<(String, bool)>,
}

/// One individual task marked for dispatch this cycle.
#[derive(Debug, Clone)]
pub struct PlannedTaskDispatch {
    pub task_id: String,
    pub agent: String,
    pub retry: bool,
    /// Set when the dispatch opened an async operation.
    pub async_op: bool,
}

/// Map queued, unbatched tasks to their best agent.
///
/// Tentative assignments count toward agent load so one planning pass
/// cannot overload a single agent. `load_cap` bounds how many in-flight
/// tasks an agent may hold and win more work; the async path raises it to
/// the throttled concurrency cap.
#[must_use]
pub fn plan_assignments(
    state: &StoreState,
    config: &OrchestratorConfig,
    load_cap: usize,
    now: i64,
) -> HashMap<String, String> {
    let mut assignments = HashMap::new();
    let mut extra_load: HashMap<String, usize> = HashMap::new();

    let mut queued: Vec<_> = state
        .queue
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Queued && t.batch_id.is_none())
        .collect();
    queued.sort_by(|a, b| {
        effective_priority(b, now)
            .cmp(&effective_priority(a, now))
            .then(a.created.cmp(&b.created))
    });

    let fallback: HashMap<String, crate::agents::registry::AgentRecord> = config
        .agents
        .iter()
        .filter(|d| !state.agents.agents.contains_key(&d.name))
        .map(|d| {
            (
                d.name.clone(),
                crate::agents::registry::AgentRecord::new(d.name.clone(), now),
            )
        })
        .collect();

    for task in queued {
        let candidates: Vec<AgentCandidate<'_>> = config
            .agents
            .iter()
            .filter_map(|definition| {
                let record = state
                    .agents
                    .agents
                    .get(&definition.name)
                    .or_else(|| fallback.get(&definition.name))?;
                let load = state.queue.agent_load(&definition.name)
                    + extra_load.get(&definition.name).copied().unwrap_or(0);
                Some(AgentCandidate {
                    definition,
                    record,
                    load,
                })
            })
            .collect();

        if let Some(agent) = select_agent(
            task,
            &candidates,
            &config.selection,
            config.dispatch.max_agent_load,
            load_cap,
        ) {
            *extra_load.entry(agent.clone()).or_default() += 1;
            assignments.insert(task.id.clone(), agent);
        }
    }

    assignments
}

/// Select and mark batches for this cycle's dispatch.
///
/// Two passes over active batches: critical work first, then the rest in
/// descending priority. Marked batches move to `assigned` and their member
/// tasks to `assigned`.
pub fn plan_batch_dispatch(
    doc: &mut QueueDocument,
    snapshot: &ResourceSnapshot,
    config: &OrchestratorConfig,
    now: i64,
) -> Vec<PlannedBatchDispatch> {
    if snapshot.limits.paused() {
        return Vec::new();
    }

    let critical_batch = |doc: &QueueDocument, batch_id: &str| {
        doc.find_batch(batch_id)
            .map(|b| {
                b.priority >= 8
                    || b.task_ids.iter().any(|id| {
                        doc.find_task(id).map(|t| is_critical(t, now)).unwrap_or(false)
                    })
            })
            .unwrap_or(false)
    };

    let mut active: Vec<(String, u8)> = doc
        .batches
        .iter()
        .filter(|b| b.status == BatchStatus::Active)
        .map(|b| (b.id.clone(), b.priority))
        .collect();
    active.sort_by(|a, b| b.1.cmp(&a.1));

    let mut ordered: Vec<String> = Vec::new();
    for (id, _) in active.iter().filter(|(id, _)| critical_batch(doc, id)) {
        ordered.push(id.clone());
    }
    for (id, _) in active.iter().filter(|(id, _)| !critical_batch(doc, id)) {
        ordered.push(id.clone());
    }

    let mut planned = Vec::new();
    for batch_id in ordered.into_iter().take(config.batching.max_batches_per_cycle) {
        let Some(batch) = doc.find_batch(&batch_id) else {
            continue;
        };
        let agent = batch.agent.clone();
        let task_ids = batch.task_ids.clone();

        let mut tasks = Vec::new();
        for task_id in &task_ids {
            if let Some(task) = doc.find_task_mut(task_id) {
                if task.status == TaskStatus::Queued {
                    task.status = TaskStatus::Assigned;
                    task.assigned_agent = Some(agent.clone());
                    tasks.push((task_id.clone(), task.retry_count > 0));
                }
            }
        }
        if tasks.is_empty() {
            continue;
        }

        if let Ok(batch) = doc.batch_mut(&batch_id) {
            batch.status = BatchStatus::Assigned;
            batch.assigned_at = Some(now);
        }
        debug!(batch_id = %batch_id, agent = %agent, size = tasks.len(), "batch dispatched");
        planned.push(PlannedBatchDispatch {
            batch_id,
            agent,
            tasks,
        });
    }
    planned
}

/// Dispatch remaining individual tasks, async when allowed.
///
/// With async enabled, each dispatched task opens an `AsyncOperation`
/// bounded by the throttled per-agent cap (with level-0 burst headroom when
/// the queue backs up). Otherwise tasks dispatch synchronously up to the
/// per-agent load cap.
pub fn plan_task_dispatch(
    state: &mut StoreState,
    snapshot: &ResourceSnapshot,
    config: &OrchestratorConfig,
    now: i64,
) -> Vec<PlannedTaskDispatch> {
    if snapshot.limits.paused() {
        return Vec::new();
    }

    let use_async = snapshot.limits.async_enabled && config.dispatch.async_enabled;
    let queued_backlog = state.queue.count_status(TaskStatus::Queued);
    let backlog_high = queued_backlog > config.queue.max_queued_tasks / 2;
    let async_cap = if snapshot.limits.throttle_level == 0 && backlog_high {
        snapshot.limits.max_concurrent_tasks.max(snapshot.limits.burst_limit)
    } else {
        snapshot.limits.max_concurrent_tasks
    };

    let load_cap = if use_async {
        async_cap
    } else {
        config.dispatch.max_agent_load
    };
    let assignments = plan_assignments(state, config, load_cap, now);

    let mut candidates: Vec<(String, String)> = Vec::new();
    {
        let mut queued: Vec<_> = state
            .queue
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && t.batch_id.is_none())
            .filter(|t| assignments.contains_key(&t.id))
            .collect();
        queued.sort_by(|a, b| {
            let crit = is_critical(b, now).cmp(&is_critical(a, now));
            crit.then(
                effective_priority(b, now)
                    .cmp(&effective_priority(a, now))
                    .then(a.created.cmp(&b.created)),
            )
        });
        for task in queued {
            candidates.push((task.id.clone(), assignments[&task.id].clone()));
        }
    }

    let mut running_ops: HashMap<String, usize> = HashMap::new();
    for op in &state.async_ops.operations {
        if op.status == AsyncOpStatus::Running {
            *running_ops.entry(op.agent.clone()).or_default() += 1;
        }
    }
    let mut sync_load: HashMap<String, usize> = HashMap::new();

    let mut planned = Vec::new();
    for (task_id, agent) in candidates {
        let Some(task) = state.queue.find_task(&task_id) else {
            continue;
        };
        if !can_start_task(&task.task_type, snapshot, &config.resources) {
            continue;
        }

        if use_async {
            let running = running_ops.get(&agent).copied().unwrap_or(0);
            if running >= async_cap {
                // excess falls back to synchronous queuing
                continue;
            }
            let retry = task.retry_count > 0;
            let op = AsyncOperation::new(
                task_id.clone(),
                agent.clone(),
                now,
                config.dispatch.async_timeout_secs,
            );
            state.async_ops.operations.push(op);
            if let Some(task) = state.queue.find_task_mut(&task_id) {
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent.clone());
            }
            *running_ops.entry(agent.clone()).or_default() += 1;
            planned.push(PlannedTaskDispatch {
                task_id,
                agent,
                retry,
                async_op: true,
            });
        } else {
            let load = state.queue.agent_load(&agent)
                + sync_load.get(&agent).copied().unwrap_or(0);
            if load >= config.dispatch.max_agent_load {
                continue;
            }
            let retry = task.retry_count > 0;
            if let Some(task) = state.queue.find_task_mut(&task_id) {
                task.status = TaskStatus::Assigned;
                task.assigned_agent = Some(agent.clone());
            }
            *sync_load.entry(agent.clone()).or_default() += 1;
            planned.push(PlannedTaskDispatch {
                task_id,
                agent,
                retry,
                async_op: false,
            });
        }
    }
    planned
}

/// Result of reconciling one async operation.
#[derive(Debug, Clone)]
pub enum AsyncOutcome {
    Finished { op_id: String, task_id: String },
    TimedOut { op_id: String, task_id: String, agent: String },
}

/// Close async operations whose task finished, flag the timed-out ones,
/// and prune stale finished records.
pub fn reconcile_async_operations(state: &mut StoreState, now: i64) -> Vec<AsyncOutcome> {
    let mut outcomes = Vec::new();

    let terminal_status = |state: &StoreState, task_id: &str| -> Option<(bool, String)> {
        if state.queue.completed.iter().any(|t| t.id == task_id) {
            return Some((true, "completed".to_string()));
        }
        if state.queue.failed.iter().any(|t| t.id == task_id) {
            return Some((false, "failed".to_string()));
        }
        // a task pulled back out of flight (retry scheduled or re-queued)
        // ends the operation too; only assigned/in-progress keep it open
        if let Some(task) = state.queue.find_task(task_id) {
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                return Some((false, "retry_scheduled".to_string()));
            }
        }
        None
    };

    let op_views: Vec<(String, String, i64)> = state
        .async_ops
        .operations
        .iter()
        .filter(|op| op.status == AsyncOpStatus::Running)
        .map(|op| (op.id.clone(), op.task_id.clone(), op.timeout_at))
        .collect();

    for (op_id, task_id, timeout_at) in op_views {
        if let Some((success, final_status)) = terminal_status(state, &task_id) {
            if let Some(op) = state.async_ops.operations.iter_mut().find(|o| o.id == op_id) {
                op.status = if success {
                    AsyncOpStatus::Completed
                } else {
                    AsyncOpStatus::Failed
                };
                op.final_status = Some(final_status);
            }
            outcomes.push(AsyncOutcome::Finished { op_id, task_id });
        } else if now >= timeout_at {
            let mut agent = String::new();
            if let Some(op) = state.async_ops.operations.iter_mut().find(|o| o.id == op_id) {
                op.status = AsyncOpStatus::Failed;
                op.error_reason = Some("async operation timed out".to_string());
                agent = op.agent.clone();
            }
            outcomes.push(AsyncOutcome::TimedOut {
                op_id,
                task_id,
                agent,
            });
        }
    }

    // keep a day of finished operations for inspection
    const FINISHED_OP_TTL: i64 = 24 * 3600;
    state.async_ops.operations.retain(|op| {
        op.status == AsyncOpStatus::Running || now - op.started_at < FINISHED_OP_TTL
    });

    outcomes
}
