use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Runtime status of a managed agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Unknown,
    Available,
    Busy,
    Restarting,
    CircuitBreaker,
    Failed,
    Stopped,
}

/// Health classification from the most recent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Composite health data recorded per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub status: HealthState,
    /// Composite 0-100 score from the last check.
    pub score: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    pub check_count: u64,
    /// Consecutive unhealthy checks; reset on a healthy one.
    pub failure_count: u64,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            status: HealthState::Unknown,
            score: 0,
            issues: Vec::new(),
            check_count: 0,
            failure_count: 0,
        }
    }
}

/// Outcome of one dispatched task, kept in a bounded recent window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub duration_secs: i64,
}

/// Per-task-type performance counters for one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub completed: u64,
    pub failed: u64,
    pub total_completion_time: i64,
    pub last_updated: i64,
    /// Recent outcomes, newest last, bounded by the performance window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent: Vec<TaskOutcome>,
}

impl PerformanceEntry {
    /// Record one outcome, trimming the recent window to `window` entries.
    pub fn record(&mut self, outcome: TaskOutcome, window: usize, now: i64) {
        if outcome.success {
            self.completed += 1;
            self.total_completion_time += outcome.duration_secs;
        } else {
            self.failed += 1;
        }
        self.last_updated = now;
        self.recent.push(outcome);
        if self.recent.len() > window {
            let excess = self.recent.len() - window;
            self.recent.drain(..excess);
        }
    }

    /// Success rate over the recent window; `None` without history.
    #[must_use]
    pub fn recent_success_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let ok = self.recent.iter().filter(|o| o.success).count();
        Some(ok as f64 / self.recent.len() as f64)
    }

    /// Mean completion seconds over recent successful outcomes.
    #[must_use]
    pub fn recent_avg_completion_secs(&self) -> Option<f64> {
        let successes: Vec<_> = self.recent.iter().filter(|o| o.success).collect();
        if successes.is_empty() {
            return None;
        }
        let total: i64 = successes.iter().map(|o| o.duration_secs).sum();
        Some(total as f64 / successes.len() as f64)
    }
}

/// Persistent record of one agent's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub last_seen: i64,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<i64>,
    /// Set while the circuit breaker is open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_since: Option<i64>,
    pub health: AgentHealth,
    #[serde(default)]
    pub performance: HashMap<String, PerformanceEntry>,
}

impl AgentRecord {
    #[must_use]
    pub fn new(name: String, now: i64) -> Self {
        Self {
            name,
            status: AgentStatus::Unknown,
            pid: None,
            last_seen: now,
            restart_count: 0,
            last_restart: None,
            circuit_breaker_since: None,
            health: AgentHealth::default(),
            performance: HashMap::new(),
        }
    }

    /// True when the agent can accept new work.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self.status, AgentStatus::Available)
    }

    /// Record a task outcome under its task type.
    pub fn record_outcome(&mut self, task_type: &str, outcome: TaskOutcome, window: usize, now: i64) {
        self.performance
            .entry(task_type.to_string())
            .or_default()
            .record(outcome, window, now);
    }
}

/// Self-check record for the supervisor itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorRecord {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: i64,
    pub last_self_check: i64,
    pub health_score: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl Default for OrchestratorRecord {
    fn default() -> Self {
        Self {
            status: "unknown".to_string(),
            pid: None,
            started_at: 0,
            last_self_check: 0,
            health_score: 0,
            issues: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn performance_window_is_bounded() {
        let mut entry = PerformanceEntry::default();
        for i in 0..30 {
            entry.record(
                TaskOutcome {
                    success: i % 2 == 0,
                    duration_secs: 10,
                },
                20,
                1_000 + i,
            );
        }
        assert_eq!(entry.recent.len(), 20);
        assert_eq!(entry.completed + entry.failed, 30);
    }

    #[test]
    fn success_rate_reflects_recent_window() {
        let mut entry = PerformanceEntry::default();
        for _ in 0..4 {
            entry.record(
                TaskOutcome {
                    success: true,
                    duration_secs: 30,
                },
                10,
                1_000,
            );
        }
        entry.record(
            TaskOutcome {
                success: false,
                duration_secs: 0,
            },
            10,
            1_000,
        );
        let rate = entry.recent_success_rate().unwrap();
        assert!((rate - 0.8).abs() < 1e-9);
        assert_eq!(entry.recent_avg_completion_secs(), Some(30.0));
    }

    #[test]
    fn no_history_means_no_rate() {
        let entry = PerformanceEntry::default();
        assert!(entry.recent_success_rate().is_none());
        assert!(entry.recent_avg_completion_secs().is_none());
    }
}
