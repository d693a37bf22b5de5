//! Smart agent selection.
//!
//! Each candidate agent is scored for a task as a weighted sum of
//! capability fit, current load, and historical performance for that task
//! type. A mandatory-agent mapping short-circuits the scoring; a capability
//! floor keeps tasks queued when no agent fits.

use crate::agents::registry::{AgentRecord, AgentStatus};
use crate::tasks::task::Task;
use crate::utils::config::{AgentDefinition, SelectionConfig};

/// Recognized near matches between a task type and an agent capability.
const NEAR_MATCHES: [(&str, &str); 4] = [
    ("debug", "fix"),
    ("build", "test"),
    ("generate", "create"),
    ("ui", "ux"),
];

/// One agent considered for a task.
pub struct AgentCandidate<'a> {
    pub definition: &'a AgentDefinition,
    pub record: &'a AgentRecord,
    /// In-flight tasks currently held by the agent.
    pub load: usize,
}

/// Detailed scoring result, useful for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentScore {
    pub agent: String,
    pub capability: f64,
    pub load: f64,
    pub performance: f64,
    pub total: f64,
}

fn near_match(task_type: &str, capability: &str) -> bool {
    NEAR_MATCHES
        .iter()
        .any(|(a, b)| (task_type == *a && capability == *b) || (task_type == *b && capability == *a))
}

fn capability_score(task_type: &str, candidate: &AgentCandidate<'_>) -> f64 {
    let caps = &candidate.definition.capabilities;
    let base = if caps.iter().any(|c| c == task_type) {
        100.0
    } else if caps.iter().any(|c| near_match(task_type, c)) {
        80.0
    } else {
        return 0.0;
    };

    let mut score = base + f64::from(candidate.definition.priority);
    if candidate.record.is_available() {
        score += 10.0;
    }
    score.min(100.0)
}

fn load_score(candidate: &AgentCandidate<'_>, max_agent_load: usize) -> f64 {
    let load_pct = if max_agent_load == 0 {
        100.0
    } else {
        candidate.load as f64 / max_agent_load as f64 * 100.0
    };

    let mut score: f64 = if load_pct <= 40.0 {
        100.0
    } else if load_pct <= 60.0 {
        60.0
    } else if load_pct <= 80.0 {
        40.0
    } else {
        20.0
    };

    match candidate.record.status {
        AgentStatus::Available => score += 10.0,
        AgentStatus::Busy => score -= 20.0,
        _ => {}
    }
    score.clamp(0.0, 100.0)
}

fn performance_score(task_type: &str, candidate: &AgentCandidate<'_>) -> f64 {
    let mut score = 50.0;

    if let Some(entry) = candidate.record.performance.get(task_type) {
        if let Some(rate) = entry.recent_success_rate() {
            // success-rate term in [-20, +20] around a 50% baseline
            score += ((rate - 0.5) * 40.0).clamp(-20.0, 20.0);
        }
        if let Some(avg_secs) = entry.recent_avg_completion_secs() {
            score += if avg_secs < 60.0 {
                5.0
            } else if avg_secs < 300.0 {
                2.0
            } else if avg_secs < 900.0 {
                0.0
            } else {
                -5.0
            };
        }
    }
    score.clamp(0.0, 100.0)
}

/// Score one candidate for a task.
#[must_use]
pub fn score_agent(
    task: &Task,
    candidate: &AgentCandidate<'_>,
    config: &SelectionConfig,
    max_agent_load: usize,
) -> AgentScore {
    let capability = capability_score(&task.task_type, candidate);
    let load = load_score(candidate, max_agent_load);
    let performance = performance_score(&task.task_type, candidate);

    let total = config.capability_weight * capability
        + config.load_weight * load
        + config.performance_weight * performance;

    AgentScore {
        agent: candidate.definition.name.clone(),
        capability,
        load,
        performance,
        total,
    }
}

/// Pick the best agent for a task, or `None` to leave it queued.
///
/// Agents in a non-dispatchable state (circuit breaker, failed, stopped,
/// restarting) or already at `load_cap` never win; `max_agent_load` stays
/// the denominator for load scoring so async dispatch can raise the cap
/// without skewing scores. A mandatory mapping for the task type
/// short-circuits scoring when that agent is usable.
#[must_use]
pub fn select_agent(
    task: &Task,
    candidates: &[AgentCandidate<'_>],
    config: &SelectionConfig,
    max_agent_load: usize,
    load_cap: usize,
) -> Option<String> {
    let usable = |c: &&AgentCandidate<'_>| {
        !matches!(
            c.record.status,
            AgentStatus::CircuitBreaker
                | AgentStatus::Failed
                | AgentStatus::Stopped
                | AgentStatus::Restarting
        ) && c.load < load_cap
    };

    if let Some(mandatory) = config.mandatory_agents.get(&task.task_type) {
        return candidates
            .iter()
            .filter(usable)
            .find(|c| &c.definition.name == mandatory)
            .map(|c| c.definition.name.clone());
    }

    candidates
        .iter()
        .filter(usable)
        .map(|c| score_agent(task, c, config, max_agent_load))
        .filter(|s| s.capability > 0.0 && s.total >= config.capability_floor)
        .max_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal))
        .map(|s| s.agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::registry::TaskOutcome;
    use std::path::PathBuf;

    fn definition(name: &str, capabilities: &[&str], priority: u8) -> AgentDefinition {
        AgentDefinition {
            name: name.to_string(),
            executable: PathBuf::from(format!("/usr/local/bin/{name}")),
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
            priority,
        }
    }

    fn record(name: &str, status: AgentStatus) -> AgentRecord {
        let mut record = AgentRecord::new(name.to_string(), 1_000);
        record.status = status;
        record
    }

    fn task(task_type: &str) -> Task {
        Task::new(
            "task_1000_1".to_string(),
            task_type.to_string(),
            "Run the suite".to_string(),
            5,
            1_000,
        )
    }

    #[test]
    fn idle_agent_beats_loaded_agent() {
        let def_a = definition("agent_a", &["test"], 5);
        let def_b = definition("agent_b", &["test"], 5);
        let rec_a = record("agent_a", AgentStatus::Busy);
        let rec_b = record("agent_b", AgentStatus::Available);

        let candidates = vec![
            AgentCandidate {
                definition: &def_a,
                record: &rec_a,
                load: 3,
            },
            AgentCandidate {
                definition: &def_b,
                record: &rec_b,
                load: 0,
            },
        ];

        let selected = select_agent(&task("test"), &candidates, &SelectionConfig::default(), 3, 3);
        assert_eq!(selected.as_deref(), Some("agent_b"));
    }

    #[test]
    fn near_match_scores_below_exact_match() {
        let def_fix = definition("agent_fix", &["fix"], 5);
        let def_debug = definition("agent_debug", &["debug"], 5);
        let rec = record("agent_fix", AgentStatus::Available);

        let near = AgentCandidate {
            definition: &def_fix,
            record: &rec,
            load: 0,
        };
        let exact = AgentCandidate {
            definition: &def_debug,
            record: &rec,
            load: 0,
        };

        let config = SelectionConfig::default();
        let near_score = score_agent(&task("debug"), &near, &config, 3);
        let exact_score = score_agent(&task("debug"), &exact, &config, 3);
        assert!(exact_score.capability > near_score.capability);
        assert!(near_score.capability >= 80.0);
    }

    #[test]
    fn incapable_agents_leave_task_queued() {
        let def = definition("agent_docs", &["docs"], 5);
        let rec = record("agent_docs", AgentStatus::Available);
        let candidates = vec![AgentCandidate {
            definition: &def,
            record: &rec,
            load: 0,
        }];

        let selected = select_agent(&task("build"), &candidates, &SelectionConfig::default(), 3, 3);
        assert!(selected.is_none());
    }

    #[test]
    fn mandatory_agent_short_circuits_scoring() {
        let def_a = definition("agent_a", &["deploy"], 9);
        let def_b = definition("agent_b", &["deploy"], 1);
        let rec_a = record("agent_a", AgentStatus::Available);
        let rec_b = record("agent_b", AgentStatus::Busy);

        let candidates = vec![
            AgentCandidate {
                definition: &def_a,
                record: &rec_a,
                load: 0,
            },
            AgentCandidate {
                definition: &def_b,
                record: &rec_b,
                load: 1,
            },
        ];

        let mut config = SelectionConfig::default();
        config
            .mandatory_agents
            .insert("deploy".to_string(), "agent_b".to_string());

        let selected = select_agent(&task("deploy"), &candidates, &config, 3, 3);
        assert_eq!(selected.as_deref(), Some("agent_b"));
    }

    #[test]
    fn circuit_breaker_agents_never_win() {
        let def = definition("agent_a", &["test"], 5);
        let rec = record("agent_a", AgentStatus::CircuitBreaker);
        let candidates = vec![AgentCandidate {
            definition: &def,
            record: &rec,
            load: 0,
        }];

        let selected = select_agent(&task("test"), &candidates, &SelectionConfig::default(), 3, 3);
        assert!(selected.is_none());
    }

    #[test]
    fn strong_history_lifts_performance_score() {
        let def = definition("agent_a", &["test"], 5);
        let mut rec = record("agent_a", AgentStatus::Available);
        for _ in 0..10 {
            rec.record_outcome(
                "test",
                TaskOutcome {
                    success: true,
                    duration_secs: 30,
                },
                20,
                1_000,
            );
        }

        let candidate = AgentCandidate {
            definition: &def,
            record: &rec,
            load: 0,
        };
        let score = score_agent(&task("test"), &candidate, &SelectionConfig::default(), 3);
        // 50 base + 20 success-rate + 5 fast completion
        assert!((score.performance - 75.0).abs() < 1e-9);
    }
}
