//! The supervisor loop.
//!
//! Composes every component into the periodic tick: resource throttling,
//! storage optimization, queue limits, batching, notification processing,
//! dispatch, health checks, async reconciliation, analytics, and
//! external-task ingestion. Component errors are logged and the loop
//! continues; the status report always reflects current truth.

use crate::agents::process::ProcessManager;
use crate::agents::registry::{AgentStatus, TaskOutcome};
use crate::communication::transport::{
    AgentEvent, FileTransport, InboundEvent, Transport,
};
use crate::core::scheduler::{retry, workflow, Scheduler};
use crate::infrastructure::analytics::{build_status, AnalyticsCollector};
use crate::infrastructure::health::HealthMonitor;
use crate::infrastructure::persistence::{QueueStore, StoreState};
use crate::infrastructure::resource_monitor::ResourceMonitor;
use crate::tasks::queue::{AdmissionOutcome, QueueManager};
use crate::tasks::task::{TaskRequest, TaskStatus};
use crate::utils::config::OrchestratorConfig;
use crate::utils::error::{OrchestratorError, OrchestratorResult};
use crate::utils::now_ts;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Follow-up transport events produced while applying notifications.
#[derive(Debug, Default)]
struct NotificationEffects {
    /// (agent, event) pairs to send after the mutation commits.
    outbound: Vec<(String, AgentEvent)>,
}

/// The long-running supervisor composing all components.
pub struct Supervisor {
    config: Arc<OrchestratorConfig>,
    store: Arc<QueueStore>,
    transport: Arc<FileTransport>,
    scheduler: Scheduler,
    queue_manager: QueueManager,
    health: HealthMonitor,
    resources: ResourceMonitor,
    analytics: AnalyticsCollector,
    processes: Arc<ProcessManager>,
}

impl Supervisor {
    /// Build the supervisor and its component tree.
    pub async fn new(config: Arc<OrchestratorConfig>) -> OrchestratorResult<Self> {
        let store = Arc::new(QueueStore::open(&config.paths.data_dir).await?);
        let transport = Arc::new(
            FileTransport::open(config.paths.data_dir.join("notifications")).await?,
        );
        let processes = Arc::new(ProcessManager::new(
            &config.paths.data_dir,
            &config.paths.log_dir,
        ));

        let scheduler = Scheduler::new(
            config.clone(),
            store.clone(),
            transport.clone() as Arc<dyn Transport>,
        );
        let queue_manager = QueueManager::new(config.clone(), store.clone());
        let health = HealthMonitor::new(config.clone(), store.clone(), processes.clone());
        let resources = ResourceMonitor::new(config.resources.clone(), config.dispatch.clone());
        let analytics = AnalyticsCollector::new(config.clone(), store.clone());

        Ok(Self {
            config,
            store,
            transport,
            scheduler,
            queue_manager,
            health,
            resources,
            analytics,
            processes,
        })
    }

    /// Path of the supervisor's own pid file.
    #[must_use]
    pub fn pid_file(config: &OrchestratorConfig) -> PathBuf {
        config.paths.data_dir.join("orchestrator.pid")
    }

    /// Launch every configured agent process.
    pub async fn spawn_agents(&self) -> OrchestratorResult<()> {
        let now = now_ts();
        for definition in &self.config.agents {
            let pid = self.processes.spawn_agent(definition).await?;
            let name = definition.name.clone();
            self.store
                .mutate(move |state| {
                    let record = state
                        .agents
                        .agents
                        .entry(name.clone())
                        .or_insert_with(|| {
                            crate::agents::registry::AgentRecord::new(name.clone(), now)
                        });
                    record.pid = Some(pid);
                    record.last_seen = now;
                    record.status = AgentStatus::Available;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Terminate every agent with a recorded pid.
    pub async fn stop_agents(&self) -> OrchestratorResult<()> {
        for definition in &self.config.agents {
            if let Some(pid) = self.processes.read_pid(&definition.name).await {
                if let Err(e) = self.processes.terminate(&definition.name, pid).await {
                    warn!(agent = %definition.name, error = %e, "failed to stop agent");
                }
            }
            let name = definition.name.clone();
            let _ = self
                .store
                .mutate(move |state| {
                    if let Some(record) = state.agents.agents.get_mut(&name) {
                        record.status = AgentStatus::Stopped;
                        record.pid = None;
                    }
                    Ok(())
                })
                .await;
        }
        Ok(())
    }

    /// Record the supervisor's own pid and startup state.
    pub async fn register_self(&self) -> OrchestratorResult<()> {
        let now = now_ts();
        let pid = std::process::id();
        fs::write(Self::pid_file(&self.config), format!("{pid}\n"))
            .await
            .map_err(OrchestratorError::store)?;
        self.store
            .mutate(move |state| {
                state.agents.orchestrator.pid = Some(pid);
                state.agents.orchestrator.started_at = now;
                state.agents.orchestrator.status = "running".to_string();
                Ok(())
            })
            .await
    }

    /// Admit one task request through the queue manager.
    pub async fn submit_task(&self, request: TaskRequest) -> OrchestratorResult<AdmissionOutcome> {
        let now = now_ts();
        let agent_hint = request.agent.clone();
        let outcome = self.queue_manager.admit(request, now).await?;
        if let (AdmissionOutcome::Admitted { task_id, .. }, Some(agent)) = (&outcome, agent_hint) {
            self.transport
                .notify_agent(
                    &agent,
                    now,
                    &AgentEvent::NewTask {
                        task_id: task_id.clone(),
                    },
                )
                .await?;
        }
        Ok(outcome)
    }

    /// Run the supervisor loop until shutdown is signalled.
    pub async fn run(&mut self) -> OrchestratorResult<()> {
        info!(
            tick_secs = self.config.supervisor.tick_interval_secs,
            agents = self.config.agents.len(),
            "supervisor loop started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(
            self.config.supervisor.tick_interval_secs,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(now_ts()).await;
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "failed to listen for shutdown signal");
                    }
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.stop_agents().await {
            warn!(error = %e, "error stopping agents during shutdown");
        }
        let _ = self
            .store
            .mutate(|state| {
                state.agents.orchestrator.status = "stopped".to_string();
                state.agents.orchestrator.pid = None;
                Ok(())
            })
            .await;
        let _ = fs::remove_file(Self::pid_file(&self.config)).await;
        info!("supervisor stopped");
    }

    /// One pass of the supervisor loop. Steps run in a fixed order and a
    /// failing step never stops the tick.
    pub async fn tick(&mut self, now: i64) {
        let snapshot = self.resources.check(now);

        if let Err(e) = self.queue_manager.optimize_storage(now).await {
            error!(error = %e, "storage optimization failed");
        }
        if let Err(e) = self.queue_manager.enforce_limits(now).await {
            error!(error = %e, "queue limit enforcement failed");
        }
        if let Err(e) = self.queue_manager.apply_retention(now).await {
            error!(error = %e, "retention failed");
        }
        if let Err(e) = self.scheduler.cleanup_batches(now).await {
            error!(error = %e, "batch cleanup failed");
        }
        if let Err(e) = self.scheduler.create_batches(now).await {
            error!(error = %e, "batch creation failed");
        }
        if let Err(e) = self.process_notifications(now).await {
            error!(error = %e, "notification processing failed");
        }
        if let Err(e) = self.scheduler.dispatch_batches(&snapshot, now).await {
            error!(error = %e, "batch dispatch failed");
        }
        if let Err(e) = self.health.check_agents(now).await {
            error!(error = %e, "agent health checks failed");
        }
        if let Err(e) = self.health.self_check(now).await {
            error!(error = %e, "orchestrator self-check failed");
        }
        if let Err(e) = self.scheduler.process_async_operations(now).await {
            error!(error = %e, "async operation processing failed");
        }
        match self.analytics.collect(now).await {
            Ok(true) => debug!("analytics snapshot collected"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "analytics collection failed"),
        }
        if let Err(e) = self.analytics.report(now).await {
            error!(error = %e, "analytics report failed");
        }
        if let Err(e) = self.scheduler.distribute_tasks(&snapshot, now).await {
            error!(error = %e, "task distribution failed");
        }
        if let Err(e) = self.analytics.status_report(now).await {
            error!(error = %e, "status report failed");
        }
        if let Err(e) = self.ingest_inbox(now).await {
            error!(error = %e, "inbox ingestion failed");
        }
    }

    /// Drain inbound notification streams, apply each event exactly once in
    /// arrival order, and truncate a stream only after its events applied.
    pub async fn process_notifications(&self, now: i64) -> OrchestratorResult<usize> {
        let batches = self.transport.read_inbound().await?;
        let mut applied = 0;

        for batch in batches {
            let events = batch.events.clone();
            let config = self.config.clone();
            let effects: NotificationEffects = self
                .store
                .mutate(move |state| {
                    let mut effects = NotificationEffects::default();
                    for event in &events {
                        apply_notification(state, event, &config, now, &mut effects)?;
                    }
                    Ok(effects)
                })
                .await?;

            applied += batch.events.len();
            self.transport.commit_inbound(batch.kind).await?;

            for (agent, event) in effects.outbound {
                self.transport.notify_agent(&agent, now, &event).await?;
            }
        }
        Ok(applied)
    }

    /// Ingest external task requests dropped into the inbox directory.
    ///
    /// Each `*.json` file holds one request; malformed files are set aside
    /// with a `.rejected` suffix rather than retried forever.
    pub async fn ingest_inbox(&self, _now: i64) -> OrchestratorResult<usize> {
        let inbox = &self.config.paths.inbox_dir;
        let mut entries = match fs::read_dir(inbox).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(OrchestratorError::store(e)),
        };

        let mut ingested = 0;
        while let Some(entry) = entries.next_entry().await.map_err(OrchestratorError::store)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable inbox file");
                    continue;
                }
            };

            match serde_json::from_str::<TaskRequest>(&content) {
                Ok(request) => {
                    match self.submit_task(request).await {
                        Ok(AdmissionOutcome::Admitted { task_id, .. }) => {
                            info!(task_id = %task_id, path = %path.display(), "external task ingested");
                            ingested += 1;
                        }
                        Ok(outcome) => {
                            debug!(path = %path.display(), ?outcome, "external task rejected");
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "external task failed");
                        }
                    }
                    let _ = fs::remove_file(&path).await;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed inbox file set aside");
                    let rejected = path.with_extension("json.rejected");
                    let _ = fs::rename(&path, &rejected).await;
                }
            }
        }
        Ok(ingested)
    }

    /// Machine-readable status snapshot.
    pub async fn status(&self) -> serde_json::Value {
        let state = self.store.snapshot().await;
        build_status(&state, now_ts())
    }

    /// Shared store handle for the HTTP surface.
    #[must_use]
    pub fn store(&self) -> Arc<QueueStore> {
        self.store.clone()
    }
}

/// Apply one inbound event to the state. Handlers are idempotent: a
/// re-delivered event for a task already past that transition is a no-op.
fn apply_notification(
    state: &mut StoreState,
    event: &InboundEvent,
    config: &OrchestratorConfig,
    now: i64,
    effects: &mut NotificationEffects,
) -> OrchestratorResult<()> {
    match event {
        InboundEvent::Started { ts, task_id } => {
            let Some(task) = state.queue.find_task_mut(task_id) else {
                debug!(task_id = %task_id, "start for unknown or finished task ignored");
                return Ok(());
            };
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Queued) {
                return Ok(());
            }
            task.status = TaskStatus::InProgress;
            task.started_at = Some(*ts);
            if let Some(agent) = task.assigned_agent.clone() {
                touch_agent(state, &agent, now, AgentStatus::Busy);
            }
        }

        InboundEvent::Completed {
            ts,
            task_id,
            success,
        } => {
            if !*success {
                apply_task_failure(state, task_id, "agent reported unsuccessful completion", config, now)?;
                return Ok(());
            }
            complete_task(state, task_id, *ts, config, now, effects);
        }

        InboundEvent::Failed { task_id, error, .. } => {
            apply_task_failure(state, task_id, error, config, now)?;
        }

        InboundEvent::BatchCompleted {
            ts,
            batch_id,
            success,
        } => {
            let Some(batch) = state.queue.find_batch(batch_id) else {
                debug!(batch_id = %batch_id, "completion for unknown batch ignored");
                return Ok(());
            };
            if batch.status == crate::tasks::task::BatchStatus::Completed {
                return Ok(());
            }
            let member_ids = batch.task_ids.clone();

            for member_id in &member_ids {
                if state.queue.find_task(member_id).is_none() {
                    continue;
                }
                if *success {
                    complete_task(state, member_id, *ts, config, now, effects);
                } else {
                    apply_task_failure(
                        state,
                        member_id,
                        "batch reported unsuccessful completion",
                        config,
                        now,
                    )?;
                }
            }

            let batch = state.queue.batch_mut(batch_id)?;
            batch.status = crate::tasks::task::BatchStatus::Completed;
            batch.completed_at = Some(*ts);
            batch.success = Some(*success);
        }
    }
    Ok(())
}

/// Complete one task: record timing and agent performance, move it to
/// history, and unblock dependents.
fn complete_task(
    state: &mut StoreState,
    task_id: &str,
    ts: i64,
    config: &OrchestratorConfig,
    now: i64,
    effects: &mut NotificationEffects,
) {
    let Some(task) = state.queue.find_task_mut(task_id) else {
        // already applied; idempotent re-delivery
        return;
    };
    if task.status.is_terminal() {
        return;
    }
    task.status = TaskStatus::Completed;
    task.completed_at = Some(ts);
    let agent = task.assigned_agent.clone();
    let task_type = task.task_type.clone();
    let duration = (ts - task.started_at.unwrap_or(ts)).max(0);

    if state.queue.move_to_completed(task_id).is_err() {
        return;
    }

    if let Some(agent_name) = agent {
        if let Some(record) = state.agents.agents.get_mut(&agent_name) {
            record.record_outcome(
                &task_type,
                TaskOutcome {
                    success: true,
                    duration_secs: duration,
                },
                config.selection.performance_window,
                now,
            );
            record.last_seen = now;
        }
        let remaining = state.queue.agent_load(&agent_name);
        touch_agent(
            state,
            &agent_name,
            now,
            if remaining > 0 {
                AgentStatus::Busy
            } else {
                AgentStatus::Available
            },
        );
    }

    for unblocked in workflow::on_dependency_completed(&mut state.queue, task_id) {
        debug!(task_id = %unblocked, "dependency satisfied, task unblocked");
        if let Some(agent) = state
            .queue
            .find_task(&unblocked)
            .and_then(|t| t.assigned_agent.clone())
        {
            effects
                .outbound
                .push((agent, AgentEvent::DependencySatisfied { task_id: unblocked }));
        }
    }
}

/// Fail one task through the retry path, recording agent performance.
fn apply_task_failure(
    state: &mut StoreState,
    task_id: &str,
    error: &str,
    config: &OrchestratorConfig,
    now: i64,
) -> OrchestratorResult<()> {
    let Some(task) = state.queue.find_task(task_id) else {
        debug!(task_id = %task_id, "failure for unknown or finished task ignored");
        return Ok(());
    };
    if task.status.is_terminal() {
        return Ok(());
    }
    let agent = task.assigned_agent.clone();
    let task_type = task.task_type.clone();

    // gate evaluation first: the retry decision reads the performance
    // history as it stood before this failure
    retry::apply_failure_with_gates(state, task_id, error, config, now)?;

    if let Some(agent_name) = &agent {
        if let Some(record) = state.agents.agents.get_mut(agent_name) {
            record.record_outcome(
                &task_type,
                TaskOutcome {
                    success: false,
                    duration_secs: 0,
                },
                config.selection.performance_window,
                now,
            );
            record.last_seen = now;
        }
    }

    if let Some(agent_name) = agent {
        let remaining = state.queue.agent_load(&agent_name);
        touch_agent(
            state,
            &agent_name,
            now,
            if remaining > 0 {
                AgentStatus::Busy
            } else {
                AgentStatus::Available
            },
        );
    }
    Ok(())
}

fn touch_agent(state: &mut StoreState, agent: &str, now: i64, status: AgentStatus) {
    if let Some(record) = state.agents.agents.get_mut(agent) {
        record.last_seen = now;
        // lifecycle states managed by the health monitor take precedence
        if matches!(
            record.status,
            AgentStatus::Available | AgentStatus::Busy | AgentStatus::Unknown
        ) {
            record.status = status;
        }
    }
}
