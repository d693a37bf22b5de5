//! Per-agent restart circuit breaker.
//!
//! Repeatedly unhealthy agents trip the breaker: restarts pause for the
//! reset window, and a stable period afterwards clears the restart count
//! and returns the agent to service.

use crate::agents::registry::{AgentRecord, AgentStatus, HealthState};
use crate::utils::config::HealthConfig;
use tracing::{info, warn};

/// Breaker state derived from the agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Reset window elapsed; the next healthy check closes the breaker.
    HalfOpen,
}

/// Current breaker state for an agent.
#[must_use]
pub fn circuit_state(record: &AgentRecord, config: &HealthConfig, now: i64) -> CircuitState {
    match record.circuit_breaker_since {
        None => CircuitState::Closed,
        Some(since) if now - since >= config.circuit_breaker_reset_secs => CircuitState::HalfOpen,
        Some(_) => CircuitState::Open,
    }
}

/// Fold one health check outcome into the agent record.
///
/// Opens the breaker after `max_failures` consecutive unhealthy checks;
/// closes it, resetting the restart count, on the first healthy check after
/// the reset window.
pub fn record_check(record: &mut AgentRecord, healthy: bool, config: &HealthConfig, now: i64) {
    record.health.check_count += 1;
    record.health.status = if healthy {
        HealthState::Healthy
    } else {
        HealthState::Unhealthy
    };

    if healthy {
        record.health.failure_count = 0;
        if circuit_state(record, config, now) == CircuitState::HalfOpen {
            info!(agent = %record.name, "circuit breaker reset after stable period");
            record.circuit_breaker_since = None;
            record.restart_count = 0;
            record.status = AgentStatus::Available;
        }
        return;
    }

    record.health.failure_count += 1;
    if record.health.failure_count >= config.max_failures
        && record.circuit_breaker_since.is_none()
    {
        warn!(
            agent = %record.name,
            failures = record.health.failure_count,
            "circuit breaker opened"
        );
        record.circuit_breaker_since = Some(now);
        record.status = AgentStatus::CircuitBreaker;
    }
}

/// Exponential restart backoff: `base * 2^restart_count`, capped.
#[must_use]
pub fn restart_backoff_secs(restart_count: u32, config: &HealthConfig) -> i64 {
    let shift = restart_count.min(30);
    let delay = config
        .restart_backoff_base_secs
        .saturating_mul(1_i64 << shift);
    delay.min(config.restart_backoff_cap_secs)
}

/// Whether an automatic restart may run now.
#[must_use]
pub fn restart_allowed(record: &AgentRecord, config: &HealthConfig, now: i64) -> bool {
    if circuit_state(record, config, now) == CircuitState::Open {
        return false;
    }
    match record.last_restart {
        None => true,
        Some(last) => now - last >= restart_backoff_secs(record.restart_count, config),
    }
}
