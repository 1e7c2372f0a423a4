//! Durable execution state.
//!
//! The whole execution (plan, task statuses, session records) is
//! serialized to a single JSON snapshot so an interrupted run can be
//! inspected and resumed. Writes go through a temp file and an atomic
//! rename, with the previous snapshot kept as a .bak. Loading is
//! fail-closed: an unreadable or version-mismatched snapshot is an
//! error, never a silent fresh start.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::events::Progress;
use crate::plan::ExecutionPlan;
use crate::session::{SessionId, SessionStatus};
use crate::task::{Task, TaskId, TaskStatus};
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Snapshot schema version. Bump on any incompatible change.
pub const STATE_VERSION: u32 = 1;

/// Record of one session, past or present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// How many times this task's session has been retried.
    pub attempt: u32,
}

/// The full durable state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: u32,
    pub plan: ExecutionPlan,
    pub tasks: Vec<Task>,
    pub sessions: Vec<SessionRecord>,
    /// Index of the wave currently (or last) being executed.
    pub current_wave: usize,
    /// Branch completed work merges into.
    pub target_branch: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(plan: ExecutionPlan, tasks: Vec<Task>, target_branch: String) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            plan,
            tasks,
            sessions: Vec::new(),
            current_wave: 0,
            target_branch,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn record_session(&mut self, record: SessionRecord) {
        self.sessions.push(record);
        self.updated_at = Utc::now();
    }

    pub fn update_session(&mut self, session_id: SessionId, status: SessionStatus) {
        if let Some(record) = self
            .sessions
            .iter_mut()
            .find(|r| r.session_id == session_id)
        {
            if status.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
            record.status = status;
            self.updated_at = Utc::now();
        }
    }

    /// Latest session record for a task, if any.
    pub fn session_for(&self, task_id: &TaskId) -> Option<&SessionRecord> {
        self.sessions.iter().rev().find(|r| &r.task_id == task_id)
    }

    /// Tasks not yet in a terminal status. Always recomputed from task
    /// statuses, never cached: after a crash any Running entries are
    /// stale processes that no longer exist, so they count as remaining.
    pub fn remaining_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| !t.is_terminal()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.is_terminal())
    }

    /// Whether a loaded snapshot represents work worth resuming.
    pub fn has_incomplete_execution(&self) -> bool {
        !self.is_complete()
    }

    pub fn completed_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut running = 0;
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed { .. } => failed += 1,
                TaskStatus::Skipped { .. } => skipped += 1,
                TaskStatus::Running => running += 1,
                TaskStatus::Pending => {}
            }
        }
        Progress::new(self.tasks.len(), completed, failed, skipped, running)
    }
}

/// Writes and loads state snapshots, and drives the dirty-flag
/// autosave loop.
pub struct StateStore {
    path: PathBuf,
    dirty: Arc<AtomicBool>,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.bak")
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persist a snapshot: serialize to a temp file in the same
    /// directory, keep the previous snapshot as .bak, then rename into
    /// place. A crash mid-save leaves either the old file or the new
    /// one, never a torn write.
    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;

        if self.path.exists() {
            if let Err(e) = std::fs::copy(&self.path, self.backup_path()) {
                clog_warn!("Could not write state backup: {}", e);
            }
        }
        std::fs::rename(&tmp, &self.path)?;
        self.dirty.store(false, Ordering::SeqCst);
        clog_debug!("State snapshot saved to {}", self.path.display());
        Ok(())
    }

    /// Load the snapshot. Missing file is Ok(None). Unparseable JSON
    /// and version mismatches are hard errors.
    pub fn load(&self) -> Result<Option<ExecutionState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let state: ExecutionState = serde_json::from_str(&raw)
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        if state.version != STATE_VERSION {
            return Err(Error::StateVersionMismatch {
                expected: STATE_VERSION,
                found: state.version,
            });
        }
        Ok(Some(state))
    }

    /// Last-resort load of the .bak snapshot, same validation rules.
    pub fn load_backup(&self) -> Result<Option<ExecutionState>> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&backup)?;
        let state: ExecutionState = serde_json::from_str(&raw)
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        if state.version != STATE_VERSION {
            return Err(Error::StateVersionMismatch {
                expected: STATE_VERSION,
                found: state.version,
            });
        }
        Ok(Some(state))
    }

    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let backup = self.backup_path();
        if backup.exists() {
            std::fs::remove_file(backup)?;
        }
        Ok(())
    }

    /// Background autosave: every `interval`, write a snapshot if and
    /// only if something changed since the last save.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        state: Arc<RwLock<ExecutionState>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if store.is_dirty() {
                            let snapshot = state.read().await.clone();
                            if let Err(e) = store.save(&snapshot) {
                                clog_warn!("Autosave failed: {}", e);
                            }
                        }
                    }
                }
            }
            // Final save on shutdown so the snapshot reflects the end.
            if store.is_dirty() {
                let snapshot = state.read().await.clone();
                if let Err(e) = store.save(&snapshot) {
                    clog_warn!("Final autosave failed: {}", e);
                } else {
                    clog!("Final state snapshot written");
                }
            }
        })
    }
}
