//! Agent and orchestrator health monitoring.
//!
//! Every check interval each agent is probed for process liveness,
//! responsiveness, recent log errors and restart churn, producing a
//! composite 0-100 score. Unhealthy agents are restarted under the circuit
//! breaker's supervision. The orchestrator also scores itself.

use crate::agents::process::ProcessManager;
use crate::agents::registry::{AgentRecord, AgentStatus};
use crate::infrastructure::circuit_breaker::{self, CircuitState};
use crate::infrastructure::persistence::QueueStore;
use crate::utils::config::OrchestratorConfig;
use crate::utils::error::OrchestratorResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signals gathered for one agent before scoring.
#[derive(Debug, Clone)]
struct AgentProbe {
    name: String,
    pid: Option<u32>,
    alive: bool,
    log_errors: usize,
}

/// Composite health evaluation of one probe against a record.
#[derive(Debug, Clone)]
pub struct HealthEvaluation {
    pub healthy: bool,
    pub score: u8,
    pub issues: Vec<String>,
}

/// Score an agent from its probe signals.
///
/// Process absence or unresponsiveness makes the agent unhealthy; log
/// errors and restart churn only degrade the score.
fn evaluate(
    probe: &AgentProbe,
    record: &AgentRecord,
    config: &OrchestratorConfig,
    now: i64,
) -> HealthEvaluation {
    let mut score: i32 = 100;
    let mut issues = Vec::new();

    if !probe.alive {
        score -= 50;
        issues.push("process not running".to_string());
    }

    let responsive = now - record.last_seen <= config.health.agent_timeout_secs;
    if !responsive {
        score -= 30;
        issues.push(format!(
            "unresponsive for {}s",
            now - record.last_seen
        ));
    }

    if probe.log_errors >= config.health.log_error_threshold {
        score -= 10;
        issues.push(format!("{} recent log errors", probe.log_errors));
    }

    let churn_window = 2 * config.health.circuit_breaker_reset_secs;
    if record.restart_count >= 3
        && record.last_restart.map_or(false, |t| now - t < churn_window)
    {
        score -= 10;
        issues.push(format!("{} restarts recently", record.restart_count));
    }

    HealthEvaluation {
        healthy: probe.alive && responsive,
        score: score.clamp(0, 100) as u8,
        issues,
    }
}

/// The health monitoring component.
pub struct HealthMonitor {
    config: Arc<OrchestratorConfig>,
    store: Arc<QueueStore>,
    processes: Arc<ProcessManager>,
    last_check: i64,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: Arc<QueueStore>,
        processes: Arc<ProcessManager>,
    ) -> Self {
        Self {
            config,
            store,
            processes,
            last_check: 0,
        }
    }

    /// Run agent health checks if the interval elapsed. Returns the names
    /// of agents restarted this pass.
    pub async fn check_agents(&mut self, now: i64) -> OrchestratorResult<Vec<String>> {
        if now - self.last_check < self.config.health.check_interval_secs {
            return Ok(Vec::new());
        }
        self.last_check = now;

        // probe processes and logs outside the store lock
        let mut probes = Vec::new();
        for definition in &self.config.agents {
            let pid = self.processes.read_pid(&definition.name).await;
            let alive = pid.map(ProcessManager::is_alive).unwrap_or(false);
            let log_errors = self
                .processes
                .recent_log_errors(&definition.name, self.config.health.log_scan_lines)
                .await;
            probes.push(AgentProbe {
                name: definition.name.clone(),
                pid,
                alive,
                log_errors,
            });
        }

        // fold probes into records and decide restarts
        let config = self.config.clone();
        let probe_set = probes.clone();
        let restarts: Vec<String> = self
            .store
            .mutate(move |state| {
                let mut to_restart = Vec::new();
                for probe in &probe_set {
                    let record = state
                        .agents
                        .agents
                        .entry(probe.name.clone())
                        .or_insert_with(|| AgentRecord::new(probe.name.clone(), now));
                    record.pid = probe.pid;

                    let evaluation = evaluate(probe, record, &config, now);
                    circuit_breaker::record_check(record, evaluation.healthy, &config.health, now);
                    record.health.score = evaluation.score;
                    record.health.issues = evaluation.issues.clone();

                    let breaker =
                        circuit_breaker::circuit_state(record, &config.health, now);
                    if evaluation.healthy {
                        if breaker == CircuitState::Closed
                            && !matches!(record.status, AgentStatus::Busy)
                        {
                            let load = state_queue_load(&state.queue, &probe.name);
                            record.status = if load > 0 {
                                AgentStatus::Busy
                            } else {
                                AgentStatus::Available
                            };
                        }
                        continue;
                    }

                    debug!(
                        agent = %probe.name,
                        score = evaluation.score,
                        issues = ?evaluation.issues,
                        "agent unhealthy"
                    );
                    if config.health.auto_recovery
                        && circuit_breaker::restart_allowed(record, &config.health, now)
                    {
                        record.status = AgentStatus::Restarting;
                        to_restart.push(probe.name.clone());
                    } else if breaker == CircuitState::Open {
                        // restarts stay paused while the breaker is open
                    } else {
                        record.status = AgentStatus::Failed;
                    }
                }
                Ok(to_restart)
            })
            .await?;

        for name in &restarts {
            self.restart_agent(name, now).await?;
        }
        Ok(restarts)
    }

    /// Terminate (if needed) and relaunch one agent, persisting the new pid.
    async fn restart_agent(&self, name: &str, now: i64) -> OrchestratorResult<()> {
        let Some(definition) = self.config.agent_definition(name) else {
            warn!(agent = name, "restart requested for unknown agent");
            return Ok(());
        };

        if let Some(pid) = self.processes.read_pid(name).await {
            if ProcessManager::is_alive(pid) {
                self.processes.terminate(name, pid).await?;
            }
        }

        match self.processes.spawn_agent(definition).await {
            Ok(pid) => {
                info!(agent = name, pid, "agent restarted");
                let agent = name.to_string();
                self.store
                    .mutate(move |state| {
                        if let Some(record) = state.agents.agents.get_mut(&agent) {
                            record.pid = Some(pid);
                            record.restart_count += 1;
                            record.last_restart = Some(now);
                            record.last_seen = now;
                            record.status = AgentStatus::Available;
                        }
                        Ok(())
                    })
                    .await
            }
            Err(e) => {
                warn!(agent = name, error = %e, "agent restart failed");
                let agent = name.to_string();
                self.store
                    .mutate(move |state| {
                        if let Some(record) = state.agents.agents.get_mut(&agent) {
                            record.restart_count += 1;
                            record.last_restart = Some(now);
                            record.status = AgentStatus::Failed;
                        }
                        Ok(())
                    })
                    .await
            }
        }
    }

    /// Score the orchestrator itself and persist the result.
    pub async fn self_check(&self, now: i64) -> OrchestratorResult<u8> {
        let queue_accessible = file_accessible(&self.store.queue_file()).await;
        let agents_accessible = file_accessible(&self.store.agents_file()).await;
        let rss_mb = resident_memory_mb();

        self.store
            .mutate(move |state| {
                let mut score: i32 = 100;
                let mut issues = Vec::new();

                if !queue_accessible {
                    score -= 20;
                    issues.push("queue file not accessible".to_string());
                }
                if !agents_accessible {
                    score -= 20;
                    issues.push("agent store not accessible".to_string());
                }

                let available = state
                    .agents
                    .agents
                    .values()
                    .filter(|r| r.is_available() || r.status == AgentStatus::Busy)
                    .count();
                if available == 0 {
                    score -= 20;
                    issues.push("no available agents".to_string());
                }

                let backlog = state
                    .queue
                    .tasks
                    .iter()
                    .filter(|t| t.status == crate::tasks::task::TaskStatus::Queued)
                    .count();
                if backlog >= 100 {
                    score -= 20;
                    issues.push(format!("queued backlog at {backlog}"));
                }

                if rss_mb >= 500 {
                    score -= 20;
                    issues.push(format!("resident memory at {rss_mb} MB"));
                }

                let score = score.clamp(0, 100) as u8;
                state.agents.orchestrator.status = if score >= 60 {
                    "healthy".to_string()
                } else {
                    "degraded".to_string()
                };
                state.agents.orchestrator.last_self_check = now;
                state.agents.orchestrator.health_score = score;
                state.agents.orchestrator.issues = issues;
                Ok(score)
            })
            .await
    }
}

fn state_queue_load(queue: &crate::infrastructure::persistence::QueueDocument, agent: &str) -> usize {
    queue.agent_load(agent)
}

async fn file_accessible(path: &std::path::Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(_) => true,
        // a store that has not persisted yet is still healthy
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Resident set size in MB, best effort.
fn resident_memory_mb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb / 1024;
                }
            }
        }
    }
    0
}
