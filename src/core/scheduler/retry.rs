//! Failure handling and retry scheduling.
//!
//! Failed tasks are classified by their error text; transient failures are
//! retried with exponential backoff while the retry budget and the agent's
//! condition allow it. Anything else fails permanently and cascades to
//! dependents.

use crate::agents::registry::AgentRecord;
use crate::core::scheduler::workflow;
use crate::infrastructure::persistence::QueueDocument;
use crate::tasks::task::TaskStatus;
use crate::utils::config::RetryConfig;
use rand::Rng;
use tracing::{debug, info};

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Classify an error string by substring match; unknown errors default to
/// transient so a flaky agent gets another chance.
#[must_use]
pub fn classify_error(error: &str, config: &RetryConfig) -> ErrorKind {
    let lower = error.to_lowercase();
    if config.permanent_tokens.iter().any(|t| lower.contains(t)) {
        return ErrorKind::Permanent;
    }
    if config.transient_tokens.iter().any(|t| lower.contains(t)) {
        return ErrorKind::Transient;
    }
    ErrorKind::Transient
}

/// Backoff delay before attempt `retry_count + 1`, jittered.
#[must_use]
pub fn backoff_delay(retry_count: u32, config: &RetryConfig) -> i64 {
    let exp = config.backoff_multiplier.powi(retry_count as i32);
    let raw = (config.base_delay_secs as f64 * exp) as i64;
    let capped = raw.min(config.max_delay_secs);

    if config.jitter_percent == 0 {
        return capped;
    }
    let jitter_span = f64::from(config.jitter_percent) / 100.0;
    let factor = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let jittered = (capped as f64 * (1.0 + factor)) as i64;
    jittered.clamp(1, config.max_delay_secs)
}

/// Outcome of handling a failure notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task was rescheduled for a later attempt.
    RetryScheduled { retry_at: i64 },
    /// The task failed permanently; these dependents were cancelled.
    FailedPermanently { cancelled: Vec<String> },
}

/// Context the retry gates need about the failing agent.
pub struct RetryGateContext<'a> {
    pub record: Option<&'a AgentRecord>,
    pub agent_load: usize,
    pub max_agent_load: usize,
    pub queued_backlog: usize,
}

fn gates_pass(
    task_type: &str,
    retry_count: u32,
    ctx: &RetryGateContext<'_>,
    config: &RetryConfig,
) -> bool {
    if retry_count >= config.max_attempts {
        return false;
    }
    if ctx.max_agent_load > 0 {
        let load_fraction = ctx.agent_load as f64 / ctx.max_agent_load as f64;
        if load_fraction >= config.agent_load_threshold {
            return false;
        }
    }
    if ctx.queued_backlog >= config.queue_backlog_threshold {
        return false;
    }
    if let Some(record) = ctx.record {
        if let Some(rate) = record
            .performance
            .get(task_type)
            .and_then(|e| e.recent_success_rate())
        {
            if rate < config.success_rate_threshold {
                return false;
            }
        }
    }
    true
}

/// Apply a failure to a live task inside a store mutation.
///
/// Either schedules a retry (`retry_scheduled` with a future `retry_at`) or
/// fails the task permanently and cancels its dependents.
pub fn handle_failure(
    doc: &mut QueueDocument,
    task_id: &str,
    error: &str,
    ctx: &RetryGateContext<'_>,
    config: &RetryConfig,
    now: i64,
) -> crate::utils::error::OrchestratorResult<FailureOutcome> {
    let task = doc.task_mut(task_id)?;
    let task_type = task.task_type.clone();
    let retry_count = task.retry_count;

    let retriable = classify_error(error, config) == ErrorKind::Transient
        && gates_pass(&task_type, retry_count, ctx, config);

    if retriable {
        let delay = backoff_delay(retry_count, config);
        let retry_at = now + delay;
        task.status = TaskStatus::RetryScheduled;
        task.retry_count = retry_count + 1;
        task.retry_at = Some(retry_at);
        task.last_error = Some(error.to_string());
        let batch_id = task.batch_id.take();
        detach_from_batch(doc, task_id, batch_id);
        debug!(
            task_id,
            attempt = retry_count + 1,
            delay_secs = delay,
            "retry scheduled"
        );
        return Ok(FailureOutcome::RetryScheduled { retry_at });
    }

    task.status = TaskStatus::Failed;
    task.failed_at = Some(now);
    task.last_error = Some(error.to_string());
    let batch_id = task.batch_id.clone();
    detach_from_batch(doc, task_id, batch_id);
    doc.move_to_failed(task_id)?;
    let cancelled = workflow::on_dependency_failed(doc, task_id, now);
    info!(task_id, cancelled = cancelled.len(), error = %error, "task failed permanently");
    Ok(FailureOutcome::FailedPermanently { cancelled })
}

/// Drop a task from its batch membership when it leaves the batch's
/// lifecycle through retry or permanent failure.
fn detach_from_batch(doc: &mut QueueDocument, task_id: &str, batch_id: Option<String>) {
    let Some(batch_id) = batch_id else {
        return;
    };
    if let Some(batch) = doc.batches.iter_mut().find(|b| b.id == batch_id) {
        batch.task_ids.retain(|id| id != task_id);
    }
}

/// Apply a failure against full store state, deriving the retry gates from
/// the failing task's agent and the queue backlog.
pub fn apply_failure_with_gates(
    state: &mut crate::infrastructure::persistence::StoreState,
    task_id: &str,
    error: &str,
    config: &crate::utils::config::OrchestratorConfig,
    now: i64,
) -> crate::utils::error::OrchestratorResult<FailureOutcome> {
    let agent = state
        .queue
        .find_task(task_id)
        .and_then(|t| t.assigned_agent.clone());
    let record = agent
        .as_deref()
        .and_then(|name| state.agents.agents.get(name).cloned());
    let ctx = RetryGateContext {
        record: record.as_ref(),
        agent_load: agent
            .as_deref()
            .map(|name| state.queue.agent_load(name))
            .unwrap_or(0),
        max_agent_load: config.dispatch.max_agent_load,
        queued_backlog: state.queue.count_status(TaskStatus::Queued),
    };
    handle_failure(&mut state.queue, task_id, error, &ctx, &config.retry, now)
}

/// Move due `retry_scheduled` tasks back to `queued`.
///
/// The previous agent assignment is cleared so selection can prefer an
/// alternative if the original is still unavailable. Returns released ids.
pub fn release_due_retries(doc: &mut QueueDocument, now: i64) -> Vec<String> {
    let mut released = Vec::new();
    for task in &mut doc.tasks {
        if task.status == TaskStatus::RetryScheduled
            && task.retry_at.map_or(false, |at| at <= now)
        {
            task.status = TaskStatus::Queued;
            task.retry_at = None;
            task.assigned_agent = None;
            task.batch_id = None;
            released.push(task.id.clone());
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::task::Task;

    fn config_without_jitter() -> RetryConfig {
        RetryConfig {
            jitter_percent: 0,
            ..RetryConfig::default()
        }
    }

    fn queued(doc: &mut QueueDocument, id: &str, task_type: &str) {
        doc.tasks.push(Task::new(
            id.to_string(),
            task_type.to_string(),
            "Ship the feature".to_string(),
            5,
            1_000,
        ));
    }

    fn open_gates() -> RetryGateContext<'static> {
        RetryGateContext {
            record: None,
            agent_load: 0,
            max_agent_load: 3,
            queued_backlog: 0,
        }
    }

    #[test]
    fn classification_by_token() {
        let config = RetryConfig::default();
        assert_eq!(
            classify_error("connection refused", &config),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_error("Permission denied while writing", &config),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify_error("something unexpected happened", &config),
            ErrorKind::Transient
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = config_without_jitter();
        assert_eq!(backoff_delay(0, &config), 60);
        assert_eq!(backoff_delay(1, &config), 120);
        assert_eq!(backoff_delay(2, &config), 240);
        assert_eq!(backoff_delay(10, &config), config.max_delay_secs);
    }

    #[test]
    fn jitter_stays_within_band() {
        let config = RetryConfig {
            jitter_percent: 20,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let delay = backoff_delay(0, &config);
            assert!((48..=72).contains(&delay), "delay out of band: {delay}");
        }
    }

    #[test]
    fn transient_failure_schedules_retry() {
        let mut doc = QueueDocument::default();
        queued(&mut doc, "task_1000_1", "build");
        let config = config_without_jitter();

        let outcome = handle_failure(
            &mut doc,
            "task_1000_1",
            "connection refused",
            &open_gates(),
            &config,
            5_000,
        )
        .unwrap();

        assert_eq!(outcome, FailureOutcome::RetryScheduled { retry_at: 5_060 });
        let task = doc.find_task("task_1000_1").unwrap();
        assert_eq!(task.status, TaskStatus::RetryScheduled);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.retry_at, Some(5_060));
    }

    #[test]
    fn permanent_failure_skips_retry() {
        let mut doc = QueueDocument::default();
        queued(&mut doc, "task_1000_1", "build");

        let outcome = handle_failure(
            &mut doc,
            "task_1000_1",
            "permission denied",
            &open_gates(),
            &config_without_jitter(),
            5_000,
        )
        .unwrap();

        assert!(matches!(outcome, FailureOutcome::FailedPermanently { .. }));
        assert_eq!(doc.failed.len(), 1);
    }

    #[test]
    fn retry_budget_is_exhausted_at_max_attempts() {
        let mut doc = QueueDocument::default();
        queued(&mut doc, "task_1000_1", "build");
        let config = config_without_jitter();

        // at max_attempts - 1, exactly one more retry fits
        doc.find_task_mut("task_1000_1").unwrap().retry_count = config.max_attempts - 1;
        let outcome = handle_failure(
            &mut doc,
            "task_1000_1",
            "timeout",
            &open_gates(),
            &config,
            5_000,
        )
        .unwrap();
        assert!(matches!(outcome, FailureOutcome::RetryScheduled { .. }));
        assert_eq!(
            doc.find_task("task_1000_1").unwrap().retry_count,
            config.max_attempts
        );

        // the next failure is final
        doc.find_task_mut("task_1000_1").unwrap().status = TaskStatus::InProgress;
        let outcome = handle_failure(
            &mut doc,
            "task_1000_1",
            "timeout",
            &open_gates(),
            &config,
            6_000,
        )
        .unwrap();
        assert!(matches!(outcome, FailureOutcome::FailedPermanently { .. }));
    }

    #[test]
    fn loaded_agent_blocks_retry() {
        let mut doc = QueueDocument::default();
        queued(&mut doc, "task_1000_1", "build");
        let ctx = RetryGateContext {
            record: None,
            agent_load: 3,
            max_agent_load: 3,
            queued_backlog: 0,
        };

        let outcome = handle_failure(
            &mut doc,
            "task_1000_1",
            "timeout",
            &ctx,
            &config_without_jitter(),
            5_000,
        )
        .unwrap();
        assert!(matches!(outcome, FailureOutcome::FailedPermanently { .. }));
    }

    #[test]
    fn due_retries_return_to_queue() {
        let mut doc = QueueDocument::default();
        queued(&mut doc, "task_1000_1", "build");
        {
            let task = doc.find_task_mut("task_1000_1").unwrap();
            task.status = TaskStatus::RetryScheduled;
            task.retry_at = Some(4_000);
            task.assigned_agent = Some("agent_build".to_string());
        }
        queued(&mut doc, "task_1000_2", "build");
        {
            let task = doc.find_task_mut("task_1000_2").unwrap();
            task.status = TaskStatus::RetryScheduled;
            task.retry_at = Some(9_000);
        }

        let released = release_due_retries(&mut doc, 5_000);
        assert_eq!(released, vec!["task_1000_1".to_string()]);
        let task = doc.find_task("task_1000_1").unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.assigned_agent.is_none());
        assert_eq!(
            doc.find_task("task_1000_2").unwrap().status,
            TaskStatus::RetryScheduled
        );
    }
}
