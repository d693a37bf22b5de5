use crate::utils::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for the task orchestrator.
///
/// Every tuning constant the components read lives here. The value is
/// immutable after startup and shared by `Arc`; nothing reads process-wide
/// mutable globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub paths: PathsConfig,
    pub queue: QueueConfig,
    pub compression: CompressionConfig,
    pub batching: BatchingConfig,
    pub dispatch: DispatchConfig,
    pub retry: RetryConfig,
    pub selection: SelectionConfig,
    pub health: HealthConfig,
    pub resources: ResourceConfig,
    pub analytics: AnalyticsConfig,
    pub supervisor: SupervisorConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    pub agents: Vec<AgentDefinition>,
}

/// Filesystem layout for persisted state, logs and the task inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub inbox_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Admission stops when this many tasks are queued.
    pub max_queued_tasks: usize,
    /// Hard cap on total stored tasks; excess is trimmed lowest-first.
    pub max_queue_size: usize,
    pub max_completed_history: usize,
    pub task_retention_days: i64,
    pub task_expiration_hours: i64,
    /// Window for duplicate detection, in hours.
    pub dedup_window_hours: i64,
    /// Word-set Jaccard threshold for near-duplicate descriptions.
    pub dedup_similarity_threshold: f64,
    /// Cap on health/monitor tasks admitted per dedup window.
    pub monitor_task_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Descriptions longer than this many bytes are stored compressed.
    pub threshold: usize,
    /// Completed tasks older than this are moved to archive files.
    pub retention_days: i64,
    pub max_archive_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    /// Pairwise similarity threshold for grouping tasks into a batch.
    pub similarity_threshold: f64,
    pub max_active_batches: usize,
    pub max_batches_per_cycle: usize,
    pub batch_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub async_enabled: bool,
    /// Per-agent concurrent async operation cap (before throttling).
    pub max_concurrent_tasks: usize,
    pub async_timeout_secs: i64,
    /// Extra headroom allowed at throttle level 0.
    pub burst_limit: usize,
    /// Per-agent in-flight task cap for load scoring and sync dispatch.
    pub max_agent_load: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: i64,
    pub backoff_multiplier: f64,
    pub max_delay_secs: i64,
    /// Uniform jitter applied to the delay, in percent. Zero disables it.
    pub jitter_percent: u32,
    /// Retries are withheld while the agent load fraction is at or above this.
    pub agent_load_threshold: f64,
    /// Retries are withheld while this many tasks are queued.
    pub queue_backlog_threshold: usize,
    /// Minimum rolling success rate for the (agent, type) pair.
    pub success_rate_threshold: f64,
    /// Substring markers classifying an error as transient.
    pub transient_tokens: Vec<String>,
    /// Substring markers classifying an error as permanent.
    pub permanent_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub capability_weight: f64,
    pub load_weight: f64,
    pub performance_weight: f64,
    /// Tasks stay queued when no agent scores at or above this.
    pub capability_floor: f64,
    /// Number of recent completions considered for performance scoring.
    pub performance_window: usize,
    /// Task types that must go to a specific agent, bypassing scoring.
    pub mandatory_agents: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: i64,
    /// An agent silent for longer than this is unresponsive.
    pub agent_timeout_secs: i64,
    /// Consecutive unhealthy checks before the circuit breaker opens.
    pub max_failures: u64,
    pub circuit_breaker_reset_secs: i64,
    pub auto_recovery: bool,
    pub restart_backoff_base_secs: i64,
    pub restart_backoff_cap_secs: i64,
    /// Error lines tolerated in the recent window of the agent log.
    pub log_error_threshold: usize,
    pub log_scan_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub check_interval_secs: i64,
    /// Soft threshold shared by all signals.
    pub throttle_threshold: f64,
    pub max_cpu_usage: f64,
    pub max_memory_usage: f64,
    pub max_disk_usage: f64,
    /// 1-minute load average scaled by 100.
    pub max_system_load: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub retention_days: i64,
    pub collection_interval_secs: i64,
    pub report_interval_secs: i64,
    pub status_interval_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Static definition of a worker agent the supervisor manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    /// Executable launched for this agent.
    pub executable: PathBuf,
    /// Task types this agent handles.
    pub capabilities: Vec<String>,
    /// Static priority bonus applied during selection, 1-10.
    #[serde(default = "default_agent_priority")]
    pub priority: u8,
}

fn default_agent_priority() -> u8 {
    5
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".orchestrator"),
            log_dir: PathBuf::from(".orchestrator/logs"),
            inbox_dir: PathBuf::from(".orchestrator/inbox"),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued_tasks: 50,
            max_queue_size: 200,
            max_completed_history: 100,
            task_retention_days: 7,
            task_expiration_hours: 24,
            dedup_window_hours: 24,
            dedup_similarity_threshold: 0.70,
            monitor_task_cap: 2,
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            threshold: 500,
            retention_days: 30,
            max_archive_files: 5,
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 5,
            similarity_threshold: 0.75,
            max_active_batches: 3,
            max_batches_per_cycle: 5,
            batch_interval_secs: 2,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            async_enabled: true,
            max_concurrent_tasks: 4,
            async_timeout_secs: 1800,
            burst_limit: 6,
            max_agent_load: 3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 60,
            backoff_multiplier: 2.0,
            max_delay_secs: 3600,
            jitter_percent: 20,
            agent_load_threshold: 0.8,
            queue_backlog_threshold: 25,
            success_rate_threshold: 0.3,
            transient_tokens: vec![
                "timeout".to_string(),
                "timed out".to_string(),
                "connection".to_string(),
                "network".to_string(),
                "unavailable".to_string(),
                "temporarily".to_string(),
                "resource busy".to_string(),
                "too many requests".to_string(),
            ],
            permanent_tokens: vec![
                "permission".to_string(),
                "denied".to_string(),
                "authentication".to_string(),
                "unauthorized".to_string(),
                "invalid".to_string(),
                "not found".to_string(),
                "no such file".to_string(),
            ],
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            capability_weight: 0.4,
            load_weight: 0.3,
            performance_weight: 0.3,
            capability_floor: 30.0,
            performance_window: 20,
            mandatory_agents: std::collections::HashMap::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            agent_timeout_secs: 300,
            max_failures: 3,
            circuit_breaker_reset_secs: 1800,
            auto_recovery: true,
            restart_backoff_base_secs: 60,
            restart_backoff_cap_secs: 3600,
            log_error_threshold: 5,
            log_scan_lines: 50,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            throttle_threshold: 70.0,
            max_cpu_usage: 90.0,
            max_memory_usage: 85.0,
            max_disk_usage: 90.0,
            max_system_load: 80.0,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            collection_interval_secs: 300,
            report_interval_secs: 3600,
            status_interval_secs: 300,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 7410,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            queue: QueueConfig::default(),
            compression: CompressionConfig::default(),
            batching: BatchingConfig::default(),
            dispatch: DispatchConfig::default(),
            retry: RetryConfig::default(),
            selection: SelectionConfig::default(),
            health: HealthConfig::default(),
            resources: ResourceConfig::default(),
            analytics: AnalyticsConfig::default(),
            supervisor: SupervisorConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            agents: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> OrchestratorResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestratorError::ConfigurationError {
                reason: format!("Failed to read config file: {e}"),
            }
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|e| OrchestratorError::ConfigurationError {
                reason: format!("Failed to parse config file: {e}"),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with precedence: file -> environment -> defaults.
    ///
    /// The file path comes from `ORCHESTRATOR_CONFIG` or `orchestrator.toml`
    /// in the working directory when present.
    pub fn load() -> OrchestratorResult<Self> {
        let mut config = match env::var("ORCHESTRATOR_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                let default_path = Path::new("orchestrator.toml");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> OrchestratorResult<()> {
        if let Ok(dir) = env::var("ORCHESTRATOR_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(&dir);
            self.paths.log_dir = Path::new(&dir).join("logs");
            self.paths.inbox_dir = Path::new(&dir).join("inbox");
        }
        if let Ok(level) = env::var("ORCHESTRATOR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(value) = env::var("ORCHESTRATOR_MAX_QUEUE_SIZE") {
            self.queue.max_queue_size = parse_env("ORCHESTRATOR_MAX_QUEUE_SIZE", &value)?;
        }
        if let Ok(value) = env::var("ORCHESTRATOR_MAX_CONCURRENT_TASKS") {
            self.dispatch.max_concurrent_tasks =
                parse_env("ORCHESTRATOR_MAX_CONCURRENT_TASKS", &value)?;
        }
        if let Ok(value) = env::var("ORCHESTRATOR_HTTP_PORT") {
            self.http.port = parse_env("ORCHESTRATOR_HTTP_PORT", &value)?;
            self.http.enabled = true;
        }
        Ok(())
    }

    /// Validate invariants the components rely on.
    pub fn validate(&self) -> OrchestratorResult<()> {
        let weight_sum = self.selection.capability_weight
            + self.selection.load_weight
            + self.selection.performance_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(OrchestratorError::ConfigurationError {
                reason: format!("selection weights must sum to 1.0, got {weight_sum}"),
            });
        }
        if self.queue.max_queued_tasks > self.queue.max_queue_size {
            return Err(OrchestratorError::ConfigurationError {
                reason: "max_queued_tasks cannot exceed max_queue_size".to_string(),
            });
        }
        if self.batching.max_batch_size == 0 {
            return Err(OrchestratorError::ConfigurationError {
                reason: "max_batch_size must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.queue.dedup_similarity_threshold) {
            return Err(OrchestratorError::ConfigurationError {
                reason: "dedup_similarity_threshold must be within [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.batching.similarity_threshold) {
            return Err(OrchestratorError::ConfigurationError {
                reason: "batch similarity_threshold must be within [0, 1]".to_string(),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(OrchestratorError::ConfigurationError {
                reason: "retry backoff_multiplier must be >= 1.0".to_string(),
            });
        }
        if self.retry.jitter_percent > 100 {
            return Err(OrchestratorError::ConfigurationError {
                reason: "retry jitter_percent must be within [0, 100]".to_string(),
            });
        }
        for agent in &self.agents {
            if agent.name.is_empty() {
                return Err(OrchestratorError::ConfigurationError {
                    reason: "agent name cannot be empty".to_string(),
                });
            }
            if !(1..=10).contains(&agent.priority) {
                return Err(OrchestratorError::ConfigurationError {
                    reason: format!("agent {} priority must be within [1, 10]", agent.name),
                });
            }
        }
        Ok(())
    }

    /// Look up the static definition for an agent by name.
    pub fn agent_definition(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.name == name)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> OrchestratorResult<T> {
    value
        .parse()
        .map_err(|_| OrchestratorError::ConfigurationError {
            reason: format!("invalid value for {key}: {value}"),
        })
}
