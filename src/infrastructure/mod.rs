//! Infrastructure: persistence, health, resources and analytics.

/// Analytics snapshots and reports
pub mod analytics;
/// Per-agent restart circuit breaker
pub mod circuit_breaker;
/// Agent health checks and auto-restart
pub mod health;
/// Durable store with atomic-rename snapshots
pub mod persistence;
/// Host resource sampling and throttle policy
pub mod resource_monitor;

pub use analytics::AnalyticsCollector;
pub use health::HealthMonitor;
pub use persistence::QueueStore;
pub use resource_monitor::{ResourceMonitor, ResourceSample, RuntimeLimits};
