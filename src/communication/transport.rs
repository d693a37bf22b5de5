//! File-based message passing between the supervisor and agents.
//!
//! Each agent has an append-only notification stream the supervisor writes;
//! agents write back to shared inbound streams (`completions`, `starts`,
//! `failures`, `batch_completions`). Streams are drained once per tick in
//! arrival order and truncated only after the events were applied, so
//! delivery is at-least-once and handlers must stay idempotent.
//!
//! Line format: `timestamp|event|payload[|payload]`, one event per line. The
//! format is the canonical contract so agents written in any language can
//! participate.

use crate::utils::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Events the supervisor sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    NewTask { task_id: String },
    AssignedTask { task_id: String },
    AssignedBatch { batch_id: String },
    DependencySatisfied { task_id: String },
    RetryTask { task_id: String },
    StartTask { task_id: String },
    Cancel { task_id: String },
}

impl AgentEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::NewTask { .. } => "new_task",
            Self::AssignedTask { .. } => "assigned_task",
            Self::AssignedBatch { .. } => "assigned_batch",
            Self::DependencySatisfied { .. } => "dependency_satisfied",
            Self::RetryTask { .. } => "retry_task",
            Self::StartTask { .. } => "start_task",
            Self::Cancel { .. } => "cancel",
        }
    }

    fn payload(&self) -> &str {
        match self {
            Self::NewTask { task_id }
            | Self::AssignedTask { task_id }
            | Self::DependencySatisfied { task_id }
            | Self::RetryTask { task_id }
            | Self::StartTask { task_id }
            | Self::Cancel { task_id } => task_id,
            Self::AssignedBatch { batch_id } => batch_id,
        }
    }
}

/// Events agents send back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Started {
        ts: i64,
        task_id: String,
    },
    Completed {
        ts: i64,
        task_id: String,
        success: bool,
    },
    Failed {
        ts: i64,
        task_id: String,
        error: String,
    },
    BatchCompleted {
        ts: i64,
        batch_id: String,
        success: bool,
    },
}

/// The four inbound streams, drained in this order each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Starts,
    Completions,
    Failures,
    BatchCompletions,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        Self::Starts,
        Self::Completions,
        Self::Failures,
        Self::BatchCompletions,
    ];

    fn file_name(self) -> &'static str {
        match self {
            Self::Starts => "starts.stream",
            Self::Completions => "completions.stream",
            Self::Failures => "failures.stream",
            Self::BatchCompletions => "batch_completions.stream",
        }
    }
}

/// One drained inbound stream, pending truncation.
#[derive(Debug)]
pub struct InboundBatch {
    pub kind: StreamKind,
    pub events: Vec<InboundEvent>,
}

/// Delivery seam between the supervisor and agents.
///
/// The file implementation is canonical; an in-process channel
/// implementation can stand in when agents share the address space.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append an event to one agent's notification stream.
    async fn notify_agent(&self, agent: &str, ts: i64, event: &AgentEvent)
        -> OrchestratorResult<()>;

    /// Read every inbound stream without consuming it.
    async fn read_inbound(&self) -> OrchestratorResult<Vec<InboundBatch>>;

    /// Truncate one inbound stream after its events were applied.
    async fn commit_inbound(&self, kind: StreamKind) -> OrchestratorResult<()>;
}

/// File-backed transport rooted at a notifications directory.
pub struct FileTransport {
    dir: PathBuf,
}

impl FileTransport {
    pub async fn open(dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(OrchestratorError::transport)?;
        Ok(Self { dir })
    }

    /// Path of an agent's outbound notification stream.
    #[must_use]
    pub fn agent_stream(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{agent}.notifications"))
    }

    fn stream_path(&self, kind: StreamKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    async fn append_line(path: &Path, line: &str) -> OrchestratorResult<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(OrchestratorError::transport)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(OrchestratorError::transport)?;
        file.write_all(b"\n")
            .await
            .map_err(OrchestratorError::transport)?;
        Ok(())
    }

    /// Append an inbound event the way an agent process would.
    ///
    /// Exercised by agents living in-process and by tests.
    pub async fn emit_inbound(&self, event: &InboundEvent) -> OrchestratorResult<()> {
        let (kind, line) = match event {
            InboundEvent::Started { ts, task_id } => {
                (StreamKind::Starts, format!("{ts}|started|{task_id}"))
            }
            InboundEvent::Completed {
                ts,
                task_id,
                success,
            } => (
                StreamKind::Completions,
                format!("{ts}|completed|{task_id}|{success}"),
            ),
            InboundEvent::Failed { ts, task_id, error } => (
                StreamKind::Failures,
                format!("{ts}|failed|{task_id}|{}", error.replace('\n', " ")),
            ),
            InboundEvent::BatchCompleted {
                ts,
                batch_id,
                success,
            } => (
                StreamKind::BatchCompletions,
                format!("{ts}|batch_completed|{batch_id}|{success}"),
            ),
        };
        Self::append_line(&self.stream_path(kind), &line).await
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn notify_agent(
        &self,
        agent: &str,
        ts: i64,
        event: &AgentEvent,
    ) -> OrchestratorResult<()> {
        let line = format!("{ts}|{}|{}", event.kind(), event.payload());
        Self::append_line(&self.agent_stream(agent), &line).await
    }

    async fn read_inbound(&self) -> OrchestratorResult<Vec<InboundBatch>> {
        let mut batches = Vec::new();
        for kind in StreamKind::ALL {
            let path = self.stream_path(kind);
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(OrchestratorError::transport(e)),
            };

            let mut events = Vec::new();
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_inbound_line(kind, line) {
                    Some(event) => events.push(event),
                    None => warn!(stream = kind.file_name(), line, "skipping malformed event"),
                }
            }
            if !events.is_empty() {
                batches.push(InboundBatch { kind, events });
            }
        }
        Ok(batches)
    }

    async fn commit_inbound(&self, kind: StreamKind) -> OrchestratorResult<()> {
        let path = self.stream_path(kind);
        match fs::write(&path, b"").await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::transport(e)),
        }
    }
}

fn parse_inbound_line(kind: StreamKind, line: &str) -> Option<InboundEvent> {
    let mut parts = line.splitn(4, '|');
    let ts: i64 = parts.next()?.parse().ok()?;
    let event = parts.next()?;
    let id = parts.next()?.to_string();
    let rest = parts.next();

    match (kind, event) {
        (StreamKind::Starts, "started") => Some(InboundEvent::Started { ts, task_id: id }),
        (StreamKind::Completions, "completed") => Some(InboundEvent::Completed {
            ts,
            task_id: id,
            success: rest.map_or(true, |s| s.trim() == "true"),
        }),
        (StreamKind::Failures, "failed") => Some(InboundEvent::Failed {
            ts,
            task_id: id,
            error: rest.unwrap_or("unknown error").to_string(),
        }),
        (StreamKind::BatchCompletions, "batch_completed") => Some(InboundEvent::BatchCompleted {
            ts,
            batch_id: id,
            success: rest.map_or(true, |s| s.trim() == "true"),
        }),
        _ => None,
    }
}
