//! Agent process control.
//!
//! Agents run as independent OS processes. The supervisor launches them
//! with their stdout/stderr appended to a per-agent log, records the pid in
//! `<agent>.pid`, probes liveness with signal 0, and terminates with
//! SIGTERM followed by SIGKILL after a grace period.

use crate::utils::config::AgentDefinition;
use crate::utils::error::{OrchestratorError, OrchestratorResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Launches and terminates agent processes.
pub struct ProcessManager {
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl ProcessManager {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            log_dir: log_dir.into(),
        }
    }

    /// Path of an agent's pid file.
    #[must_use]
    pub fn pid_file(&self, agent: &str) -> PathBuf {
        self.data_dir.join(format!("{agent}.pid"))
    }

    /// Path of an agent's log file.
    #[must_use]
    pub fn log_file(&self, agent: &str) -> PathBuf {
        self.log_dir.join(format!("{agent}.log"))
    }

    /// Read the recorded pid for an agent, if any.
    pub async fn read_pid(&self, agent: &str) -> Option<u32> {
        let content = tokio::fs::read_to_string(self.pid_file(agent)).await.ok()?;
        content.trim().parse().ok()
    }

    /// Probe whether a pid refers to a live process.
    #[must_use]
    pub fn is_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs error checking only
            unsafe { libc::kill(pid as i32, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    /// Launch an agent process in the background and persist its pid.
    ///
    /// The agent contract also has the agent write its own pid file at
    /// startup; the supervisor writes the same value so restarts recorded
    /// here are immediately visible to health checks.
    pub async fn spawn_agent(&self, definition: &AgentDefinition) -> OrchestratorResult<u32> {
        if !definition.executable.exists() {
            return Err(OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!(
                    "executable not found: {}",
                    definition.executable.display()
                ),
            });
        }

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!("failed to create log dir: {e}"),
            })?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(&definition.name))
            .map_err(|e| OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!("failed to open agent log: {e}"),
            })?;
        let log_err = log
            .try_clone()
            .map_err(|e| OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!("failed to clone log handle: {e}"),
            })?;

        let child = Command::new(&definition.executable)
            .env("ORCHESTRATOR_DATA_DIR", &self.data_dir)
            .env("ORCHESTRATOR_AGENT_NAME", &definition.name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!("failed to spawn: {e}"),
            })?;

        let pid = child.id().ok_or_else(|| OrchestratorError::ProcessError {
            agent: definition.name.clone(),
            reason: "spawned process has no pid".to_string(),
        })?;

        self.write_pid(&definition.name, pid).await?;
        info!(agent = %definition.name, pid, "agent process launched");
        Ok(pid)
    }

    async fn write_pid(&self, agent: &str, pid: u32) -> OrchestratorResult<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| OrchestratorError::ProcessError {
                agent: agent.to_string(),
                reason: format!("failed to create data dir: {e}"),
            })?;
        tokio::fs::write(self.pid_file(agent), format!("{pid}\n"))
            .await
            .map_err(|e| OrchestratorError::ProcessError {
                agent: agent.to_string(),
                reason: format!("failed to write pid file: {e}"),
            })
    }

    /// Terminate an agent process: SIGTERM, a 5 second grace wait, then
    /// SIGKILL if it is still running. Removes the pid file afterwards.
    pub async fn terminate(&self, agent: &str, pid: u32) -> OrchestratorResult<()> {
        #[cfg(unix)]
        {
            // SAFETY: pid was read from a pid file we or the agent wrote
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(agent, pid, "SIGTERM failed, process may already be gone");
            }

            let deadline = tokio::time::Instant::now() + TERMINATION_GRACE;
            while Self::is_alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }

            if Self::is_alive(pid) {
                warn!(agent, pid, "process survived SIGTERM, sending SIGKILL");
                // SAFETY: same pid as above
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }

        match tokio::fs::remove_file(self.pid_file(agent)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(agent, error = %e, "failed to remove pid file");
            }
        }
        Ok(())
    }

    /// Read the tail of an agent's log and count recent error lines.
    pub async fn recent_log_errors(&self, agent: &str, scan_lines: usize) -> usize {
        let Ok(content) = tokio::fs::read_to_string(self.log_file(agent)).await else {
            return 0;
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(scan_lines);
        lines[start..]
            .iter()
            .filter(|line| {
                let lower = line.to_lowercase();
                lower.contains("error") || lower.contains("panic") || lower.contains("fatal")
            })
            .count()
    }
}

/// Validate that every configured agent executable exists.
pub fn validate_executables(definitions: &[AgentDefinition]) -> OrchestratorResult<()> {
    for definition in definitions {
        if !Path::new(&definition.executable).exists() {
            return Err(OrchestratorError::ProcessError {
                agent: definition.name.clone(),
                reason: format!(
                    "executable not found: {}",
                    definition.executable.display()
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn pid_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path(), dir.path().join("logs"));

        manager.write_pid("agent_build", 4242).await.unwrap();
        assert_eq!(manager.read_pid("agent_build").await, Some(4242));
    }

    #[tokio::test]
    async fn missing_pid_file_reads_none() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path(), dir.path().join("logs"));
        assert_eq!(manager.read_pid("agent_missing").await, None);
    }

    #[test]
    fn own_process_is_alive() {
        assert!(ProcessManager::is_alive(std::process::id()));
    }

    #[tokio::test]
    async fn missing_executable_is_a_startup_error() {
        let dir = TempDir::new().unwrap();
        let manager = ProcessManager::new(dir.path(), dir.path().join("logs"));
        let definition = AgentDefinition {
            name: "agent_ghost".to_string(),
            executable: dir.path().join("does-not-exist"),
            capabilities: vec!["build".to_string()],
            priority: 5,
        };

        let result = manager.spawn_agent(&definition).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ProcessError { .. })
        ));
    }

    #[tokio::test]
    async fn log_error_counting_scans_the_tail() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        tokio::fs::create_dir_all(&log_dir).await.unwrap();
        let manager = ProcessManager::new(dir.path(), &log_dir);

        let mut lines = Vec::new();
        for i in 0..60 {
            lines.push(format!("line {i}: ERROR something broke"));
        }
        for i in 0..50 {
            lines.push(format!("line {i}: all quiet"));
        }
        lines.push("final line: error at shutdown".to_string());
        tokio::fs::write(log_dir.join("agent_build.log"), lines.join("\n"))
            .await
            .unwrap();

        // only the last 50 lines are scanned; the early error burst is out
        let count = manager.recent_log_errors("agent_build", 50).await;
        assert_eq!(count, 1);
    }
}
