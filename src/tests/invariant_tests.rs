//! Invariant checks that must hold at every tick boundary.

use super::{mark_agents_available, test_supervisor};
use crate::communication::transport::{FileTransport, InboundEvent};
use crate::infrastructure::persistence::StoreState;
use crate::infrastructure::resource_monitor::{ResourceMonitor, ResourceSample};
use crate::tasks::task::{TaskRequest, TaskStatus};
use crate::utils::config::OrchestratorConfig;
use std::collections::HashSet;

fn assert_invariants(state: &StoreState, config: &OrchestratorConfig) {
    // schema: unique ids, priority in [1, 10]
    let mut seen = HashSet::new();
    for task in state
        .queue
        .tasks
        .iter()
        .chain(&state.queue.completed)
        .chain(&state.queue.failed)
    {
        assert!(seen.insert(task.id.clone()), "duplicate task id {}", task.id);
        assert!(
            (1..=10).contains(&task.priority),
            "priority out of range on {}",
            task.id
        );
    }

    // dependency gate: unmet dependencies imply blocked/failed/cancelled
    for task in &state.queue.tasks {
        if task.dependencies.is_empty() {
            continue;
        }
        let unmet = task
            .dependencies
            .iter()
            .any(|dep| !state.queue.dependency_met(dep));
        if unmet {
            assert!(
                matches!(
                    task.status,
                    TaskStatus::Blocked | TaskStatus::Failed | TaskStatus::Cancelled
                ),
                "task {} has unmet dependencies but status {:?}",
                task.id,
                task.status
            );
        }
    }

    // retry bound
    for task in state.queue.tasks.iter().chain(&state.queue.failed) {
        assert!(
            task.retry_count <= config.retry.max_attempts,
            "retry bound exceeded on {}",
            task.id
        );
    }

    // capacity
    assert!(state.queue.count_status(TaskStatus::Queued) <= config.queue.max_queued_tasks);
    assert!(state.queue.tasks.len() <= config.queue.max_queue_size);

    // batch membership: every live member task carries the batch id
    for batch in &state.queue.batches {
        for member_id in &batch.task_ids {
            if let Some(task) = state.queue.find_task(member_id) {
                assert_eq!(
                    task.batch_id.as_deref(),
                    Some(batch.id.as_str()),
                    "batch membership broken for {member_id}"
                );
            }
        }
    }
}

#[tokio::test]
async fn invariants_hold_through_a_busy_lifecycle() {
    let (dir, mut supervisor, config) = test_supervisor().await;
    mark_agents_available(&supervisor, &config, 5_000).await;

    // a workflow chain, a few similar tasks, and an urgent singleton
    supervisor
        .submit_task(TaskRequest {
            task_type: "debug".to_string(),
            description: "Fix crash in module X".to_string(),
            priority: 8,
            agent: None,
            dependencies: Vec::new(),
        })
        .await
        .unwrap();
    for module in ["parser", "lexer", "resolver"] {
        supervisor
            .submit_task(TaskRequest {
                task_type: "test".to_string(),
                description: format!("run unit tests for {module}"),
                priority: 5,
                agent: None,
                dependencies: Vec::new(),
            })
            .await
            .unwrap();
    }
    supervisor
        .submit_task(TaskRequest {
            task_type: "security".to_string(),
            description: "audit dependency tree".to_string(),
            priority: 9,
            agent: None,
            dependencies: Vec::new(),
        })
        .await
        .unwrap();

    assert_invariants(&supervisor.store().snapshot().await, &config);

    // tick: batching, dispatch and health run
    supervisor.tick(5_100).await;
    assert_invariants(&supervisor.store().snapshot().await, &config);

    // a completion and a failure arrive
    let (started_id, failed_id) = {
        let state = supervisor.store().snapshot().await;
        let mut assigned = state
            .queue
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Assigned || t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone());
        (assigned.next(), assigned.next())
    };

    let emitter = FileTransport::open(dir.path().join("notifications"))
        .await
        .unwrap();
    if let Some(id) = &started_id {
        emitter
            .emit_inbound(&InboundEvent::Started {
                ts: 5_150,
                task_id: id.clone(),
            })
            .await
            .unwrap();
        emitter
            .emit_inbound(&InboundEvent::Completed {
                ts: 5_200,
                task_id: id.clone(),
                success: true,
            })
            .await
            .unwrap();
    }
    if let Some(id) = &failed_id {
        emitter
            .emit_inbound(&InboundEvent::Failed {
                ts: 5_210,
                task_id: id.clone(),
                error: "request timeout".to_string(),
            })
            .await
            .unwrap();
    }

    supervisor.tick(5_300).await;
    assert_invariants(&supervisor.store().snapshot().await, &config);

    // a later tick releases retries and keeps everything consistent
    supervisor.tick(6_000).await;
    assert_invariants(&supervisor.store().snapshot().await, &config);
}

#[tokio::test]
async fn store_files_stay_parseable_after_operations() {
    let (dir, supervisor, config) = test_supervisor().await;
    mark_agents_available(&supervisor, &config, 5_000).await;

    supervisor
        .submit_task(TaskRequest {
            task_type: "debug".to_string(),
            description: "Fix crash in module X".to_string(),
            priority: 8,
            agent: None,
            dependencies: Vec::new(),
        })
        .await
        .unwrap();

    // every persisted document parses and no temp artifact survives
    for name in [
        "task_queue.json",
        "agent_status.json",
        "queue_analytics.json",
        "async_operations.json",
    ] {
        let path = dir.path().join(name);
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        serde_json::from_str::<serde_json::Value>(&content).unwrap();
        assert!(!dir.path().join(format!("{name}.tmp")).exists());
    }
}

#[tokio::test]
async fn cpu_pressure_quarters_concurrency_for_next_tick() {
    let config = OrchestratorConfig::default();
    let mut monitor = ResourceMonitor::new(config.resources.clone(), config.dispatch.clone());

    monitor.apply_sample(ResourceSample {
        timestamp: 1_000,
        cpu_percent: 92.0,
        memory_percent: 30.0,
        disk_percent: 40.0,
        load_scaled: 10.0,
    });

    let limits = monitor.limits();
    assert_eq!(limits.throttle_level, 2);
    assert_eq!(
        limits.max_concurrent_tasks,
        config.dispatch.max_concurrent_tasks / 4
    );
    assert!(!limits.async_enabled);
}

#[tokio::test]
async fn retry_count_never_exceeds_budget() {
    let (dir, supervisor, config) = test_supervisor().await;
    mark_agents_available(&supervisor, &config, 5_000).await;

    supervisor
        .submit_task(TaskRequest {
            task_type: "docs".to_string(),
            description: "Write onboarding guide".to_string(),
            priority: 5,
            agent: None,
            dependencies: Vec::new(),
        })
        .await
        .unwrap();
    let task_id = {
        let state = supervisor.store().snapshot().await;
        state.queue.tasks[0].id.clone()
    };

    // a solid success history keeps the success-rate gate open so the
    // retry budget itself is what ends the loop
    supervisor
        .store()
        .mutate(|state| {
            let record = state.agents.agents.get_mut("agent_build").unwrap();
            for _ in 0..10 {
                record.record_outcome(
                    "docs",
                    crate::agents::registry::TaskOutcome {
                        success: true,
                        duration_secs: 30,
                    },
                    20,
                    4_900,
                );
            }
            Ok(())
        })
        .await
        .unwrap();

    let emitter = FileTransport::open(dir.path().join("notifications"))
        .await
        .unwrap();

    let mut now = 5_000;
    for round in 0..config.retry.max_attempts + 1 {
        // put the task in flight again
        let id = task_id.clone();
        supervisor
            .store()
            .mutate(move |state| {
                if let Some(task) = state.queue.find_task_mut(&id) {
                    task.status = TaskStatus::InProgress;
                    task.assigned_agent = Some("agent_build".to_string());
                }
                Ok(())
            })
            .await
            .unwrap();

        emitter
            .emit_inbound(&InboundEvent::Failed {
                ts: now,
                task_id: task_id.clone(),
                error: format!("request timeout round {round}"),
            })
            .await
            .unwrap();
        supervisor.process_notifications(now).await.unwrap();
        now += 10_000;
    }

    let state = supervisor.store().snapshot().await;
    // exhausted: the task is in failed history with a bounded retry count
    let task = state
        .queue
        .failed
        .iter()
        .find(|t| t.id == task_id)
        .expect("task failed permanently after exhausting retries");
    assert_eq!(task.retry_count, config.retry.max_attempts);
    assert_invariants(&state, &config);
}
