//! Analytics collection and reporting.
//!
//! Snapshots of queue depth, agent utilization, task-type distribution,
//! completion time and throughput are appended to the analytics document on
//! a fixed cadence and pruned past the retention window. Reports are
//! rendered from the same data.

use crate::infrastructure::persistence::{AnalyticsMetric, QueueStore, StoreState};
use crate::tasks::task::TaskStatus;
use crate::utils::config::OrchestratorConfig;
use crate::utils::error::OrchestratorResult;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Computes, stores and reports queue analytics.
pub struct AnalyticsCollector {
    config: Arc<OrchestratorConfig>,
    store: Arc<QueueStore>,
    last_collection: i64,
    last_report: i64,
    last_status: i64,
}

impl AnalyticsCollector {
    #[must_use]
    pub fn new(config: Arc<OrchestratorConfig>, store: Arc<QueueStore>) -> Self {
        Self {
            config,
            store,
            last_collection: 0,
            last_report: 0,
            last_status: 0,
        }
    }

    /// Append a metric snapshot if the collection interval elapsed.
    pub async fn collect(&mut self, now: i64) -> OrchestratorResult<bool> {
        if now - self.last_collection < self.config.analytics.collection_interval_secs {
            return Ok(false);
        }
        self.last_collection = now;

        let config = self.config.clone();
        self.store
            .mutate(move |state| {
                let metric = compute_metric(state, &config, now);
                state.analytics.metrics.push(metric);

                let cutoff = now - config.analytics.retention_days * 24 * 3600;
                let before = state.analytics.metrics.len();
                state.analytics.metrics.retain(|m| m.timestamp >= cutoff);
                if state.analytics.metrics.len() != before {
                    state.analytics.metadata.last_pruned = now;
                }
                if state.analytics.metadata.created == 0 {
                    state.analytics.metadata.created = now;
                }
                Ok(())
            })
            .await?;
        Ok(true)
    }

    /// Emit the hourly analytics report if due.
    pub async fn report(&mut self, now: i64) -> OrchestratorResult<bool> {
        if now - self.last_report < self.config.analytics.report_interval_secs {
            return Ok(false);
        }
        self.last_report = now;

        let state = self.store.snapshot().await;
        let window_start = now - self.config.analytics.report_interval_secs;
        let window: Vec<&AnalyticsMetric> = state
            .analytics
            .metrics
            .iter()
            .filter(|m| m.timestamp >= window_start)
            .collect();

        let avg_throughput = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|m| m.throughput_per_hour).sum::<f64>() / window.len() as f64
        };
        let avg_failure_rate = if window.is_empty() {
            0.0
        } else {
            window.iter().map(|m| m.failure_rate).sum::<f64>() / window.len() as f64
        };

        info!(
            completed = state.queue.completed.len(),
            failed = state.queue.failed.len(),
            queued = state.queue.count_status(TaskStatus::Queued),
            avg_throughput_per_hour = format!("{avg_throughput:.1}"),
            avg_failure_rate = format!("{avg_failure_rate:.2}"),
            "hourly analytics report"
        );
        Ok(true)
    }

    /// Log the periodic status report if due.
    pub async fn status_report(&mut self, now: i64) -> OrchestratorResult<bool> {
        if now - self.last_status < self.config.analytics.status_interval_secs {
            return Ok(false);
        }
        self.last_status = now;

        let state = self.store.snapshot().await;
        let report = build_status(&state, now);
        info!(status = %report, "orchestrator status");
        Ok(true)
    }
}

/// Compute one analytics snapshot from the current state.
#[must_use]
pub fn compute_metric(state: &StoreState, config: &OrchestratorConfig, now: i64) -> AnalyticsMetric {
    let queue = &state.queue;

    let mut task_type_distribution: HashMap<String, u64> = HashMap::new();
    for task in &queue.tasks {
        *task_type_distribution
            .entry(task.task_type.clone())
            .or_default() += 1;
    }

    let mut agent_utilization: HashMap<String, f64> = HashMap::new();
    let max_load = config.dispatch.max_agent_load.max(1);
    for definition in &config.agents {
        let load = queue.agent_load(&definition.name);
        agent_utilization.insert(
            definition.name.clone(),
            load as f64 / max_load as f64 * 100.0,
        );
    }

    let durations: Vec<i64> = queue
        .completed
        .iter()
        .filter_map(|t| Some(t.completed_at? - t.started_at?))
        .filter(|d| *d >= 0)
        .collect();
    let avg_completion_secs = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<i64>() as f64 / durations.len() as f64
    };

    let hour_ago = now - 3600;
    let throughput_per_hour = queue
        .completed
        .iter()
        .filter(|t| t.completed_at.map_or(false, |c| c >= hour_ago))
        .count() as f64;

    let terminal = queue.completed.len() + queue.failed.len();
    let failure_rate = if terminal == 0 {
        0.0
    } else {
        queue.failed.len() as f64 / terminal as f64
    };

    AnalyticsMetric {
        timestamp: now,
        queued: queue.count_status(TaskStatus::Queued),
        blocked: queue.count_status(TaskStatus::Blocked),
        in_progress: queue.count_status(TaskStatus::InProgress)
            + queue.count_status(TaskStatus::Assigned),
        retry_scheduled: queue.count_status(TaskStatus::RetryScheduled),
        completed_total: queue.completed.len(),
        failed_total: queue.failed.len(),
        agent_utilization,
        task_type_distribution,
        avg_completion_secs,
        throughput_per_hour,
        failure_rate,
    }
}

/// Machine-readable status snapshot used by the CLI, the HTTP surface and
/// the periodic status report.
#[must_use]
pub fn build_status(state: &StoreState, now: i64) -> serde_json::Value {
    let queue = &state.queue;
    let agents: serde_json::Value = state
        .agents
        .agents
        .values()
        .map(|record| {
            (
                record.name.clone(),
                json!({
                    "status": record.status,
                    "pid": record.pid,
                    "last_seen": record.last_seen,
                    "restart_count": record.restart_count,
                    "health_score": record.health.score,
                }),
            )
        })
        .collect::<serde_json::Map<String, serde_json::Value>>()
        .into();

    json!({
        "timestamp": now,
        "tasks": {
            "queued": queue.count_status(TaskStatus::Queued),
            "blocked": queue.count_status(TaskStatus::Blocked),
            "assigned": queue.count_status(TaskStatus::Assigned),
            "in_progress": queue.count_status(TaskStatus::InProgress),
            "retry_scheduled": queue.count_status(TaskStatus::RetryScheduled),
            "completed": queue.completed.len(),
            "failed": queue.failed.len(),
        },
        "batches": {
            "total": queue.batches.len(),
        },
        "async_operations": state.async_ops.operations.len(),
        "agents": agents,
        "orchestrator": {
            "status": state.agents.orchestrator.status,
            "health_score": state.agents.orchestrator.health_score,
            "issues": state.agents.orchestrator.issues,
        },
    })
}
