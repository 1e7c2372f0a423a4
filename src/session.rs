//! Worker session lifecycle.
//!
//! A session wraps one spawned worker process bound to one task. The
//! process runs inside the task's workspace with piped stdio; its
//! output is captured into a bounded buffer, appended to a per-session
//! log file, and forwarded as events. Status is published over a watch
//! channel so any number of callers can await completion.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::buffer::OutputBuffer;
use crate::events::ProgressReporter;
use crate::task::TaskId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// How long a stopped worker gets to exit on its own before SIGKILL.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Unique identifier for a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session status in its lifecycle.
///
/// Exactly one terminal status per session: Completed (exit 0), Failed
/// (non-zero exit, spawn failure, or timeout), or Cancelled (operator
/// stop). No Default impl; a status is always set explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SessionStatus {
    /// Session exists but the worker process is not up yet. The status
    /// channel starts here and moves to Running once spawn succeeds.
    Idle,
    /// Worker process is alive.
    Running,
    /// Worker exited with code zero.
    Completed,
    /// Worker exited non-zero, timed out, or could not be driven.
    Failed { error: String },
    /// Stopped by request before the worker finished.
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed { .. } | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed { error } => write!(f, "failed: {}", error),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything needed to launch one worker session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub task_id: TaskId,
    /// Worker executable, already resolved on PATH.
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Workspace directory the worker runs in.
    pub workdir: PathBuf,
    /// Wall-clock limit; None runs unbounded.
    pub timeout: Option<Duration>,
    /// Directory for the append-only per-session log file.
    pub log_dir: PathBuf,
    pub output_buffer_bytes: usize,
    pub stop_grace: Duration,
}

impl SessionSpec {
    pub fn new(task_id: TaskId, command: PathBuf, workdir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            task_id,
            command,
            args: Vec::new(),
            workdir,
            timeout: None,
            log_dir,
            output_buffer_bytes: 256 * 1024,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

/// Handle to a live (or finished) worker session.
///
/// Cheap to clone; all clones observe the same session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    task_id: TaskId,
    started_at: DateTime<Utc>,
    buffer: Arc<Mutex<OutputBuffer>>,
    status_rx: watch::Receiver<SessionStatus>,
    stdin_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Spawn the worker and wire up output capture and supervision.
    pub async fn spawn(spec: SessionSpec, reporter: ProgressReporter) -> Result<Self> {
        let id = SessionId::new();
        clog!(
            "Session {} spawning for task {}: {} {:?}",
            id.short(),
            spec.task_id,
            spec.command.display(),
            spec.args
        );

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::SessionSpawnFailed(format!("{}: {}", spec.command.display(), e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(spec.output_buffer_bytes)));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        let cancel = CancellationToken::new();

        let log_path = spec.log_dir.join(format!("{}.log", id));
        let log_file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => Some(Arc::new(tokio::sync::Mutex::new(f))),
            Err(e) => {
                clog_warn!("Session {}: could not open log file: {}", id.short(), e);
                None
            }
        };

        if let Some(stdout) = stdout {
            tokio::spawn(read_output(
                stdout,
                id,
                spec.task_id.clone(),
                buffer.clone(),
                log_file.clone(),
                reporter.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(read_output(
                stderr,
                id,
                spec.task_id.clone(),
                buffer.clone(),
                log_file.clone(),
                reporter.clone(),
            ));
        }

        if let Some(stdin) = stdin {
            tokio::spawn(write_stdin(stdin, stdin_rx, cancel.clone()));
        }

        // The process is up; publish the idle to running transition
        // before the supervisor can race in with a terminal status.
        let _ = status_tx.send(SessionStatus::Running);
        tokio::spawn(supervise(
            child,
            id,
            status_tx,
            cancel.clone(),
            spec.timeout,
            spec.stop_grace,
        ));

        Ok(Self {
            id,
            task_id: spec.task_id,
            started_at: Utc::now(),
            buffer,
            status_rx,
            stdin_tx,
            cancel,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// Queue a line for the worker's stdin.
    pub async fn send(&self, line: &str) -> Result<()> {
        if self.status().is_terminal() {
            return Err(Error::SessionNotRunning(self.id.to_string()));
        }
        self.stdin_tx
            .send(line.to_string())
            .await
            .map_err(|_| Error::SessionNotRunning(self.id.to_string()))
    }

    /// Request a stop. Closes stdin, waits out the grace period, then
    /// kills. Terminal sessions ignore the request.
    pub fn stop(&self) {
        if self.status().is_terminal() {
            clog_debug!("Session {}: stop ignored, already terminal", self.id.short());
            return;
        }
        clog!("Session {}: stop requested", self.id.short());
        self.cancel.cancel();
    }

    /// Await the terminal status. Any number of callers may wait; all
    /// observe the same result.
    pub async fn wait_for_completion(&self) -> SessionStatus {
        let mut rx = self.status_rx.clone();
        // The current value may already be terminal.
        if rx.borrow().is_terminal() {
            return rx.borrow().clone();
        }
        let result = rx.wait_for(|s| s.is_terminal()).await;
        match result {
            Ok(status) => status.clone(),
            // Sender dropped without a terminal status; treat as failed.
            Err(_) => SessionStatus::Failed {
                error: "session supervisor vanished".to_string(),
            },
        }
    }

    /// Retained output lines, oldest first.
    pub fn output(&self) -> String {
        match self.buffer.lock() {
            Ok(buf) => buf.contents(),
            Err(poisoned) => poisoned.into_inner().contents(),
        }
    }

    pub fn output_truncated(&self) -> bool {
        match self.buffer.lock() {
            Ok(buf) => buf.is_truncated(),
            Err(poisoned) => poisoned.into_inner().is_truncated(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("status", &self.status())
            .finish()
    }
}

async fn read_output<R>(
    reader: R,
    id: SessionId,
    task_id: TaskId,
    buffer: Arc<Mutex<OutputBuffer>>,
    log_file: Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    reporter: ProgressReporter,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match buffer.lock() {
            Ok(mut buf) => buf.push(line.clone()),
            Err(poisoned) => poisoned.into_inner().push(line.clone()),
        }
        if let Some(ref file) = log_file {
            let mut file = file.lock().await;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
        reporter.session_output(id, &task_id, &line);
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Dropping stdin on cancel closes the pipe, the first step
            // of a graceful stop.
            _ = cancel.cancelled() => break,
            line = rx.recv() => {
                let Some(line) = line else { break };
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    id: SessionId,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,
    time_limit: Option<Duration>,
    stop_grace: Duration,
) {
    let timeout_fut = async {
        match time_limit {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let status = tokio::select! {
        result = child.wait() => match result {
            Ok(exit) => exit_status_to_session_status(exit),
            Err(e) => SessionStatus::Failed {
                error: format!("wait failed: {}", e),
            },
        },
        _ = cancel.cancelled() => {
            // Stdin is closed by the writer task; give the worker the
            // grace period before killing it.
            match tokio::time::timeout(stop_grace, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    clog_warn!("Session {}: grace period expired, killing", id.short());
                    let _ = child.kill().await;
                }
            }
            SessionStatus::Cancelled
        },
        _ = timeout_fut => {
            let limit = time_limit.unwrap_or_default();
            clog_warn!("Session {}: timed out after {:?}", id.short(), limit);
            let _ = child.kill().await;
            SessionStatus::Failed {
                error: Error::SessionTimeout(limit).to_string(),
            }
        },
    };

    clog!("Session {}: {}", id.short(), status);
    let _ = status_tx.send(status);
}

fn exit_status_to_session_status(exit: std::process::ExitStatus) -> SessionStatus {
    if exit.success() {
        SessionStatus::Completed
    } else {
        let describe = match exit.code() {
            Some(code) => format!("code {}", code),
            None => "signal".to_string(),
        };
        SessionStatus::Failed {
            error: Error::NonZeroExit(describe).to_string(),
        }
    }
}
