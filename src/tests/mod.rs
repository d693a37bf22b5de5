//! Cross-component scenario and invariant tests.

mod invariant_tests;

use crate::core::Supervisor;
use crate::utils::config::{AgentDefinition, OrchestratorConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Build a supervisor rooted in a temp directory with deterministic
/// settings: no retry jitter and a build/debug capable agent fleet on disk
/// paths that exist but are never spawned.
pub async fn test_supervisor() -> (TempDir, Supervisor, Arc<OrchestratorConfig>) {
    let dir = TempDir::new().expect("temp dir");
    let mut config = OrchestratorConfig::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.paths.log_dir = dir.path().join("logs");
    config.paths.inbox_dir = dir.path().join("inbox");
    config.retry.jitter_percent = 0;
    config.batching.batch_interval_secs = 0;
    config.agents = vec![
        AgentDefinition {
            name: "agent_build".to_string(),
            executable: PathBuf::from("/bin/true"),
            capabilities: vec!["build".to_string(), "test".to_string()],
            priority: 5,
        },
        AgentDefinition {
            name: "agent_debug".to_string(),
            executable: PathBuf::from("/bin/true"),
            capabilities: vec!["debug".to_string(), "security".to_string()],
            priority: 5,
        },
    ];
    let config = Arc::new(config);
    let supervisor = Supervisor::new(config.clone()).await.expect("supervisor");
    (dir, supervisor, config)
}

/// Mark every configured agent available so dispatch can select it.
pub async fn mark_agents_available(supervisor: &Supervisor, config: &OrchestratorConfig, now: i64) {
    for definition in &config.agents {
        let mut record = crate::agents::registry::AgentRecord::new(definition.name.clone(), now);
        record.status = crate::agents::registry::AgentStatus::Available;
        supervisor
            .store()
            .set_agent_record(record)
            .await
            .expect("set agent record");
    }
}
