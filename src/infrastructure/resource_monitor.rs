//! Host resource sampling and throttling policy.
//!
//! The monitor samples CPU, memory, disk and load once per
//! `RESOURCE_CHECK_INTERVAL`, derives a throttle level 0-3, and publishes
//! the result as an explicit [`RuntimeLimits`] value the scheduler reads on
//! each tick. No component communicates limits through the process
//! environment.

use crate::utils::config::{DispatchConfig, ResourceConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One host resource sample. Percentages are 0-100; `load_scaled` is the
/// 1-minute load average multiplied by 100.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load_scaled: f64,
}

/// Effective concurrency limits derived from the throttle level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeLimits {
    pub throttle_level: u8,
    /// Per-agent concurrent task cap after throttling.
    pub max_concurrent_tasks: usize,
    pub async_enabled: bool,
    /// Extra per-agent headroom allowed at level 0.
    pub burst_limit: usize,
}

impl RuntimeLimits {
    /// Limits for a given throttle level against the configured baseline.
    #[must_use]
    pub fn for_level(level: u8, dispatch: &DispatchConfig) -> Self {
        let configured = dispatch.max_concurrent_tasks;
        let (max_concurrent, async_enabled) = match level {
            0 => (configured, dispatch.async_enabled),
            1 => ((configured / 2).max(1), dispatch.async_enabled),
            2 => ((configured / 4).max(1), false),
            _ => (0, false),
        };
        Self {
            throttle_level: level,
            max_concurrent_tasks: max_concurrent,
            async_enabled,
            burst_limit: if level == 0 { dispatch.burst_limit } else { 0 },
        }
    }

    /// True while throttling pauses all new work.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.max_concurrent_tasks == 0
    }
}

/// Sample plus the limits in force; handed to the scheduler each tick.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub sample: Option<ResourceSample>,
    pub limits: RuntimeLimits,
}

/// Derive the throttle level from a sample.
///
/// Any signal at the soft threshold throttles to level 1; any signal over
/// its hard limit throttles to level 2; disk pressure or multiple hard
/// breaches escalate to level 3.
#[must_use]
pub fn throttle_level(sample: &ResourceSample, config: &ResourceConfig) -> u8 {
    let hard_breaches = [
        sample.cpu_percent >= config.max_cpu_usage,
        sample.memory_percent >= config.max_memory_usage,
        sample.load_scaled >= config.max_system_load,
    ]
    .iter()
    .filter(|b| **b)
    .count();

    if sample.disk_percent >= config.max_disk_usage || hard_breaches >= 2 {
        return 3;
    }
    if hard_breaches == 1 {
        return 2;
    }

    let soft = config.throttle_threshold;
    if sample.cpu_percent >= soft
        || sample.memory_percent >= soft
        || sample.disk_percent >= soft
        || sample.load_scaled >= soft
    {
        return 1;
    }
    0
}

/// Gate specific task types on the resource they stress.
#[must_use]
pub fn can_start_task(task_type: &str, snapshot: &ResourceSnapshot, config: &ResourceConfig) -> bool {
    if snapshot.limits.paused() {
        return false;
    }
    let Some(sample) = snapshot.sample else {
        return true;
    };
    match task_type {
        "build" | "compile" => sample.cpu_percent < config.max_cpu_usage,
        "test" | "analyze" => sample.memory_percent < config.max_memory_usage,
        _ => true,
    }
}

/// Periodic host resource monitor.
pub struct ResourceMonitor {
    resources: ResourceConfig,
    dispatch: DispatchConfig,
    last_sample: Option<ResourceSample>,
    last_check: i64,
    limits: RuntimeLimits,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(resources: ResourceConfig, dispatch: DispatchConfig) -> Self {
        let limits = RuntimeLimits::for_level(0, &dispatch);
        Self {
            resources,
            dispatch,
            last_sample: None,
            last_check: 0,
            limits,
        }
    }

    /// Current snapshot without sampling.
    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            sample: self.last_sample,
            limits: self.limits,
        }
    }

    /// Sample the host if the check interval elapsed, updating the limits.
    pub fn check(&mut self, now: i64) -> ResourceSnapshot {
        if now - self.last_check >= self.resources.check_interval_secs {
            self.last_check = now;
            let sample = read_host_sample(now);
            self.apply_sample(sample);
        }
        self.snapshot()
    }

    /// Apply a sample directly; the seam tests and fault injection use.
    pub fn apply_sample(&mut self, sample: ResourceSample) {
        let level = throttle_level(&sample, &self.resources);
        let limits = RuntimeLimits::for_level(level, &self.dispatch);
        if level != self.limits.throttle_level {
            if level > 0 {
                warn!(
                    level,
                    cpu = sample.cpu_percent,
                    memory = sample.memory_percent,
                    disk = sample.disk_percent,
                    load = sample.load_scaled,
                    max_concurrent = limits.max_concurrent_tasks,
                    "resource throttling engaged"
                );
            } else {
                debug!("resource throttling lifted");
            }
        }
        self.last_sample = Some(sample);
        self.limits = limits;
    }

    #[must_use]
    pub fn limits(&self) -> RuntimeLimits {
        self.limits
    }
}

/// Read CPU, memory, disk and load from the host.
///
/// CPU is approximated from the 1-minute load average over the core count,
/// which tracks sustained saturation well enough for throttling decisions.
fn read_host_sample(now: i64) -> ResourceSample {
    let cores = num_cpus::get().max(1);

    let (load_one, load_scaled) = match sys_info::loadavg() {
        Ok(load) => (load.one, load.one * 100.0),
        Err(e) => {
            warn!(error = %e, "loadavg unavailable");
            (0.0, 0.0)
        }
    };
    let cpu_percent = (load_one / cores as f64 * 100.0).min(100.0);

    let memory_percent = match sys_info::mem_info() {
        Ok(mem) if mem.total > 0 => {
            (mem.total.saturating_sub(mem.avail)) as f64 / mem.total as f64 * 100.0
        }
        Ok(_) => 0.0,
        Err(e) => {
            warn!(error = %e, "memory info unavailable");
            0.0
        }
    };

    let disk_percent = match sys_info::disk_info() {
        Ok(disk) if disk.total > 0 => {
            (disk.total.saturating_sub(disk.free)) as f64 / disk.total as f64 * 100.0
        }
        Ok(_) => 0.0,
        Err(e) => {
            warn!(error = %e, "disk info unavailable");
            0.0
        }
    };

    ResourceSample {
        timestamp: now,
        cpu_percent,
        memory_percent,
        disk_percent,
        load_scaled,
    }
}
