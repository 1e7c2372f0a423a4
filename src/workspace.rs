//! Per-task isolated workspaces.
//!
//! Every task executes in its own git worktree on its own branch, so
//! concurrent workers never touch each other's files. The manager owns
//! the registry of live workspaces; nothing here is global state, and
//! the registry can always be rebuilt from git itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::git::{task_branch, GitOps, BRANCH_PREFIX};
use crate::task::TaskId;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// One tracked workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// Creates, tracks, merges, and removes task workspaces.
pub struct WorkspaceManager {
    git: GitOps,
    workspaces_dir: PathBuf,
    registry: HashMap<TaskId, WorkspaceRecord>,
}

impl WorkspaceManager {
    pub fn new(repo_path: &Path, workspaces_dir: PathBuf) -> Result<Self> {
        let git = GitOps::new(repo_path)?;
        if !workspaces_dir.exists() {
            std::fs::create_dir_all(&workspaces_dir)?;
        }
        Ok(Self {
            git,
            workspaces_dir,
            registry: HashMap::new(),
        })
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    /// Deterministic workspace location for a task.
    pub fn workspace_path(&self, task_id: &TaskId) -> PathBuf {
        self.workspaces_dir.join(dir_name(task_id))
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&WorkspaceRecord> {
        self.registry.get(task_id)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.registry.contains_key(task_id)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &WorkspaceRecord> {
        self.registry.values()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Create a fresh workspace: branch at `base_ref` (HEAD if None)
    /// plus a worktree checkout of it.
    pub fn create(&mut self, task_id: &TaskId, base_ref: Option<&str>) -> Result<&WorkspaceRecord> {
        if self.registry.contains_key(task_id) {
            return Err(Error::WorkspaceExists(task_id.to_string()));
        }
        let branch = task_branch(task_id.as_str());
        let path = self.workspace_path(task_id);
        clog!(
            "Creating workspace for {}: branch={} path={}",
            task_id,
            branch,
            path.display()
        );

        self.git
            .create_worktree(&branch, &path, base_ref)
            .map_err(|e| Error::WorkspaceCreateFailed {
                task: task_id.to_string(),
                reason: e.to_string(),
            })?;

        let record = WorkspaceRecord {
            task_id: task_id.clone(),
            path,
            branch,
            created_at: Utc::now(),
        };
        Ok(self
            .registry
            .entry(task_id.clone())
            .or_insert(record))
    }

    /// Make sure a workspace exists for the task, reattaching to a
    /// surviving branch when possible. Used on retry and resume, where
    /// partial work on the branch must not be thrown away.
    pub fn ensure(&mut self, task_id: &TaskId, base_ref: Option<&str>) -> Result<&WorkspaceRecord> {
        if self.registry.contains_key(task_id) {
            return Ok(&self.registry[task_id]);
        }
        let branch = task_branch(task_id.as_str());
        if self.git.branch_exists(&branch)? {
            let path = self.workspace_path(task_id);
            if !path.exists() {
                clog_debug!("Reattaching workspace for {} from branch {}", task_id, branch);
                self.git
                    .create_worktree_from_branch(&branch, &path)
                    .map_err(|e| Error::WorkspaceCreateFailed {
                        task: task_id.to_string(),
                        reason: e.to_string(),
                    })?;
            }
            let record = WorkspaceRecord {
                task_id: task_id.clone(),
                path,
                branch,
                created_at: Utc::now(),
            };
            return Ok(self.registry.entry(task_id.clone()).or_insert(record));
        }
        self.create(task_id, base_ref)
    }

    /// Remove a workspace's worktree, and its branch too unless the
    /// caller wants the work kept.
    pub fn remove(&mut self, task_id: &TaskId, delete_branch: bool) -> Result<()> {
        let record = self
            .registry
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.to_string()))?;

        clog!(
            "Removing workspace for {} (delete_branch={})",
            task_id,
            delete_branch
        );
        self.git
            .remove_worktree(&record.path)
            .map_err(|e| Error::WorkspaceRemoveFailed {
                task: task_id.to_string(),
                reason: e.to_string(),
            })?;

        if delete_branch {
            self.git.delete_branch(&record.branch)?;
        }
        self.registry.remove(task_id);
        Ok(())
    }

    /// Commit any outstanding work in the workspace. No-op if clean.
    pub fn commit_work(&self, task_id: &TaskId, message: &str) -> Result<()> {
        let record = self
            .registry
            .get(task_id)
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.to_string()))?;
        if self.git.is_dirty(&record.path)? {
            self.git.commit_all(&record.path, message)?;
        }
        Ok(())
    }

    /// Merge a task's branch into `target_branch`. Conflicts roll the
    /// target back and surface as `Error::MergeConflict`.
    pub fn merge(&self, task_id: &TaskId, target_branch: &str) -> Result<String> {
        let record = self
            .registry
            .get(task_id)
            .ok_or_else(|| Error::WorkspaceNotFound(task_id.to_string()))?;
        self.git.merge_branch(&record.branch, target_branch)
    }

    /// Remove the given workspaces, continuing past individual
    /// failures. Returns the failures so the caller can report them.
    pub fn cleanup_completed(
        &mut self,
        task_ids: &[TaskId],
        delete_branches: bool,
    ) -> Vec<(TaskId, Error)> {
        let mut failures = Vec::new();
        for task_id in task_ids {
            if !self.registry.contains_key(task_id) {
                continue;
            }
            if let Err(e) = self.remove(task_id, delete_branches) {
                clog_warn!("Cleanup of workspace {} failed: {}", task_id, e);
                failures.push((task_id.clone(), e));
            }
        }
        failures
    }

    /// Rebuild the registry from git: every branch in the engine's
    /// namespace whose worktree directory still exists becomes a
    /// tracked workspace. Returns the number reconciled.
    pub fn reconcile(&mut self) -> Result<usize> {
        clog_debug!("WorkspaceManager::reconcile");
        self.registry.clear();
        let mut count = 0;
        for branch in self.git.list_task_branches()? {
            let task_id = TaskId::from(&branch[BRANCH_PREFIX.len()..]);
            let path = self.workspace_path(&task_id);
            if path.exists() {
                self.registry.insert(
                    task_id.clone(),
                    WorkspaceRecord {
                        task_id,
                        path,
                        branch,
                        created_at: Utc::now(),
                    },
                );
                count += 1;
            }
        }
        clog!("Reconciled {} workspace(s) from git", count);
        Ok(count)
    }

    /// Directories under the workspaces root that no tracked workspace
    /// claims. Leftovers from crashed runs.
    pub fn orphans(&self) -> Result<Vec<PathBuf>> {
        let tracked: std::collections::HashSet<&PathBuf> =
            self.registry.values().map(|r| &r.path).collect();
        let mut orphans = Vec::new();
        for entry in std::fs::read_dir(&self.workspaces_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !tracked.contains(&path) {
                orphans.push(path);
            }
        }
        Ok(orphans)
    }

    /// Delete orphaned workspace directories and prune their stale git
    /// records. Returns how many were removed.
    pub fn cleanup_orphans(&self) -> usize {
        let orphans = match self.orphans() {
            Ok(list) => list,
            Err(e) => {
                clog_warn!("Could not list orphan workspaces: {}", e);
                return 0;
            }
        };
        let mut removed = 0;
        for path in orphans {
            clog!("Removing orphan workspace: {}", path.display());
            if std::fs::remove_dir_all(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            let _ = self.git.prune_worktrees();
        }
        removed
    }
}

/// Task ids become directory names; anything a filesystem might choke
/// on is flattened to '-'.
fn dir_name(task_id: &TaskId) -> String {
    task_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("workspaces_dir", &self.workspaces_dir)
            .field("tracked", &self.registry.len())
            .finish()
    }
}
