//! Task scheduling.
//!
//! Decides which tasks go to which agents, when, in what order, alone or in
//! batches, synchronously or asynchronously, and how failures are retried.

pub mod batching;
pub mod dispatch;
pub mod priority;
pub mod retry;
pub mod selection;
pub mod workflow;

use crate::communication::transport::{AgentEvent, Transport};
use crate::infrastructure::persistence::QueueStore;
use crate::infrastructure::resource_monitor::ResourceSnapshot;
use crate::utils::config::OrchestratorConfig;
use crate::utils::error::OrchestratorResult;
use dispatch::{AsyncOutcome, PlannedBatchDispatch, PlannedTaskDispatch};
use retry::FailureOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The scheduling component, composed by the supervisor loop.
pub struct Scheduler {
    config: Arc<OrchestratorConfig>,
    store: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<QueueStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
        }
    }

    /// Group queued tasks into batches for their selected agents.
    pub async fn create_batches(&self, now: i64) -> OrchestratorResult<Vec<String>> {
        if !self.config.batching.enabled {
            return Ok(Vec::new());
        }
        let config = self.config.clone();
        self.store
            .mutate(move |state| {
                let assignments = dispatch::plan_assignments(
                    state,
                    &config,
                    config.dispatch.max_agent_load,
                    now,
                );
                Ok(batching::create_batches(
                    &mut state.queue,
                    &assignments,
                    &config.batching,
                    now,
                ))
            })
            .await
    }

    /// Close finished batches and drop stale completed ones.
    pub async fn cleanup_batches(&self, now: i64) -> OrchestratorResult<Vec<String>> {
        self.store
            .mutate(move |state| Ok(batching::cleanup_batches(&mut state.queue, now)))
            .await
    }

    /// Dispatch up to `MAX_BATCHES_PER_CYCLE` batches, critical first, with
    /// the configured pause between batches.
    pub async fn dispatch_batches(
        &self,
        snapshot: &ResourceSnapshot,
        now: i64,
    ) -> OrchestratorResult<usize> {
        let config = self.config.clone();
        let snap = *snapshot;
        let planned: Vec<PlannedBatchDispatch> = self
            .store
            .mutate(move |state| {
                Ok(dispatch::plan_batch_dispatch(
                    &mut state.queue,
                    &snap,
                    &config,
                    now,
                ))
            })
            .await?;

        let total = planned.len();
        for (index, batch) in planned.iter().enumerate() {
            self.transport
                .notify_agent(
                    &batch.agent,
                    now,
                    &AgentEvent::AssignedBatch {
                        batch_id: batch.batch_id.clone(),
                    },
                )
                .await?;
            for (task_id, is_retry) in &batch.tasks {
                let event = if *is_retry {
                    AgentEvent::RetryTask {
                        task_id: task_id.clone(),
                    }
                } else {
                    AgentEvent::AssignedTask {
                        task_id: task_id.clone(),
                    }
                };
                self.transport.notify_agent(&batch.agent, now, &event).await?;
            }
            if index + 1 < total {
                tokio::time::sleep(Duration::from_secs(self.config.batching.batch_interval_secs))
                    .await;
            }
        }
        Ok(total)
    }

    /// Release due retries and dispatch remaining individual tasks.
    pub async fn distribute_tasks(
        &self,
        snapshot: &ResourceSnapshot,
        now: i64,
    ) -> OrchestratorResult<usize> {
        let config = self.config.clone();
        let snap = *snapshot;
        let (released, planned): (Vec<String>, Vec<PlannedTaskDispatch>) = self
            .store
            .mutate(move |state| {
                let released = retry::release_due_retries(&mut state.queue, now);
                let planned = dispatch::plan_task_dispatch(state, &snap, &config, now);
                Ok((released, planned))
            })
            .await?;

        if !released.is_empty() {
            info!(count = released.len(), "retry tasks released back to queue");
        }

        for plan in &planned {
            let event = if plan.async_op {
                AgentEvent::StartTask {
                    task_id: plan.task_id.clone(),
                }
            } else if plan.retry {
                AgentEvent::RetryTask {
                    task_id: plan.task_id.clone(),
                }
            } else {
                AgentEvent::AssignedTask {
                    task_id: plan.task_id.clone(),
                }
            };
            self.transport.notify_agent(&plan.agent, now, &event).await?;
        }
        Ok(planned.len())
    }

    /// Reconcile async operations: close finished ones and fail the timed
    /// out, which feeds the normal retry path.
    pub async fn process_async_operations(&self, now: i64) -> OrchestratorResult<()> {
        let outcomes: Vec<AsyncOutcome> = self
            .store
            .mutate(move |state| Ok(dispatch::reconcile_async_operations(state, now)))
            .await?;

        for outcome in outcomes {
            if let AsyncOutcome::TimedOut {
                task_id, agent, ..
            } = outcome
            {
                warn!(task_id = %task_id, agent = %agent, "async operation timed out");
                self.handle_task_failure(&task_id, "async operation timed out", now)
                    .await?;
                self.transport
                    .notify_agent(
                        &agent,
                        now,
                        &AgentEvent::Cancel {
                            task_id: task_id.clone(),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply a failure notification: schedule a retry or fail permanently
    /// and cascade to dependents.
    pub async fn handle_task_failure(
        &self,
        task_id: &str,
        error: &str,
        now: i64,
    ) -> OrchestratorResult<FailureOutcome> {
        let config = self.config.clone();
        let id = task_id.to_string();
        let err = error.to_string();
        self.store
            .mutate(move |state| retry::apply_failure_with_gates(state, &id, &err, &config, now))
            .await
    }
}
