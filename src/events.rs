//! Events the engine emits toward the presentation layer.
//!
//! All observability flows through a single event channel. Emission is
//! best-effort: a slow or absent consumer never blocks or fails the
//! execution path.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::clog_trace;
use crate::session::SessionId;
use crate::task::{TaskId, TaskStatus};

/// Aggregate progress across the whole execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
    pub percentage: f64,
}

impl Progress {
    pub fn new(total: usize, completed: usize, failed: usize, skipped: usize, running: usize) -> Self {
        let terminal = completed + failed + skipped;
        let percentage = if total == 0 {
            100.0
        } else {
            (terminal as f64 / total as f64) * 100.0
        };
        Self {
            total,
            completed,
            failed,
            skipped,
            running,
            percentage,
        }
    }

    /// Every task reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.completed + self.failed + self.skipped >= self.total
    }
}

/// Everything observable about a running execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    ExecutionStarted {
        total_tasks: usize,
        wave_count: usize,
    },
    WaveStarted {
        wave: usize,
        task_ids: Vec<TaskId>,
    },
    WaveCompleted {
        wave: usize,
    },
    TaskStatusChanged {
        task_id: TaskId,
        status: TaskStatus,
    },
    /// A chunk of live output from a worker session.
    SessionOutput {
        session_id: SessionId,
        task_id: TaskId,
        line: String,
    },
    ProgressUpdate {
        progress: Progress,
    },
    ExecutionCompleted {
        progress: Progress,
    },
    /// The operator stopped the execution before it finished.
    ExecutionStopped,
}

/// Non-blocking emitter over the engine's event channel.
///
/// `try_send` only: when the channel is full or closed the event is
/// dropped with a trace note. State transitions remain authoritative in
/// the state store regardless of what the consumer saw.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<EngineEvent>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Channel pair sized for bursty wave starts.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            clog_trace!("Event dropped: {}", e);
        }
    }

    pub fn task_status(&self, task_id: &TaskId, status: &TaskStatus) {
        self.emit(EngineEvent::TaskStatusChanged {
            task_id: task_id.clone(),
            status: status.clone(),
        });
    }

    pub fn session_output(&self, session_id: SessionId, task_id: &TaskId, line: &str) {
        self.emit(EngineEvent::SessionOutput {
            session_id,
            task_id: task_id.clone(),
            line: line.to_string(),
        });
    }

    pub fn progress(&self, progress: Progress) {
        self.emit(EngineEvent::ProgressUpdate { progress });
    }
}
