//! Supervisor entry point.
//!
//! Control surface: `start` launches the agents and runs the supervisor
//! loop in the foreground, `monitor` runs the loop without touching agent
//! processes, `stop` signals a running supervisor via its pid file, and
//! `status` prints a machine-readable snapshot. Startup failures (missing
//! agent executables, unreadable store, status port in use) exit non-zero.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use task_orchestrator::agents::process::{validate_executables, ProcessManager};
use task_orchestrator::core::Supervisor;
use task_orchestrator::infrastructure::analytics::build_status;
use task_orchestrator::infrastructure::persistence::QueueStore;
use task_orchestrator::utils::now_ts;
use task_orchestrator::OrchestratorConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "task-orchestrator", version, about = "Multi-agent task orchestrator")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch agents and run the supervisor loop.
    Start,
    /// Stop a running supervisor.
    Stop,
    /// Print a machine-readable status snapshot.
    Status,
    /// Run the supervisor loop in the foreground without spawning agents.
    Monitor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path),
        None => OrchestratorConfig::load(),
    }
    .context("configuration error")?;
    let config = Arc::new(config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Command::Start => run_supervisor(config, true).await,
        Command::Monitor => run_supervisor(config, false).await,
        Command::Stop => stop_supervisor(&config).await,
        Command::Status => print_status(&config).await,
    }
}

async fn run_supervisor(config: Arc<OrchestratorConfig>, spawn_agents: bool) -> anyhow::Result<()> {
    if spawn_agents {
        validate_executables(&config.agents).context("agent validation failed")?;
    }

    // bind the status port before anything else so conflicts fail startup
    let http_listener = if config.http.enabled {
        Some(
            task_orchestrator::api::bind(&config.http)
                .await
                .context("status server startup failed")?,
        )
    } else {
        None
    };

    let mut supervisor = Supervisor::new(config.clone())
        .await
        .context("failed to open orchestrator store")?;
    supervisor
        .register_self()
        .await
        .context("failed to record supervisor pid")?;

    if let Some(listener) = http_listener {
        let store = supervisor.store();
        tokio::spawn(async move {
            if let Err(e) = task_orchestrator::api::serve(listener, store).await {
                error!(error = %e, "status server exited");
            }
        });
    }

    if spawn_agents {
        supervisor
            .spawn_agents()
            .await
            .context("failed to launch agents")?;
        info!(agents = config.agents.len(), "agent fleet launched");
    }

    supervisor.run().await.context("supervisor loop failed")?;
    Ok(())
}

async fn stop_supervisor(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let pid_file = Supervisor::pid_file(config);
    let content = tokio::fs::read_to_string(&pid_file)
        .await
        .with_context(|| format!("no supervisor pid file at {}", pid_file.display()))?;
    let pid: u32 = content
        .trim()
        .parse()
        .context("invalid supervisor pid file")?;

    if !ProcessManager::is_alive(pid) {
        anyhow::bail!("supervisor pid {pid} is not running");
    }

    #[cfg(unix)]
    {
        // SAFETY: pid read from the supervisor's own pid file
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            anyhow::bail!("failed to signal supervisor pid {pid}");
        }
    }
    println!("sent stop signal to supervisor (pid {pid})");
    Ok(())
}

async fn print_status(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let store = QueueStore::open(&config.paths.data_dir)
        .await
        .context("failed to open orchestrator store")?;
    let state = store.snapshot().await;
    let status = build_status(&state, now_ts());
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
