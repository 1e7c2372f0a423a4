//! Git plumbing for workspace isolation.
//!
//! Each task gets its own branch and worktree. This module wraps the
//! git2 calls: worktree add/remove, branch lifecycle, and merging a
//! task branch back into its target with full rollback on conflict.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, MergeOptions, Repository, ResetType, Signature};

use crate::{clog_debug, clog_warn, Error, Result};

/// Prefix for branches owned by this engine. Reconciliation and cleanup
/// only ever touch branches under this namespace.
pub const BRANCH_PREFIX: &str = "cascade/task/";

pub fn task_branch(task_id: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, task_id)
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        clog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create a branch at `base_ref` (HEAD if None) and check it out
    /// into a new worktree at `worktree_path`.
    pub fn create_worktree(
        &self,
        branch: &str,
        worktree_path: &Path,
        base_ref: Option<&str>,
    ) -> Result<()> {
        clog_debug!(
            "GitOps::create_worktree branch={} path={} base={:?}",
            branch,
            worktree_path.display(),
            base_ref
        );
        let repo = self.repo()?;
        let commit = match base_ref {
            Some(rev) => repo.revparse_single(rev)?.peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };
        clog_debug!("Creating branch {} from commit {}", branch, commit.id());
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Worktree names cannot contain slashes, so use the directory
        // name rather than the branch name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        clog_debug!("Worktree created: {}", worktree_name);
        Ok(())
    }

    /// Check an existing branch out into a new worktree. Used when
    /// retrying a task whose branch survived a crash.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.repo()?;
        let branch_ref = repo.find_branch(branch, git2::BranchType::Local)?;
        let reference = branch_ref.into_reference();

        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));

        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);

        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and clean up its administrative state.
    ///
    /// The admin dir under .git/worktrees must go too, or git keeps
    /// treating the branch as checked out and refuses to delete it.
    /// Cleanup continues past individual failures.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        clog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        // Match by registered path first; fall back to the directory
        // name since paths may differ after canonicalization.
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(|s| s.to_string());

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name = worktree_name.or_else(|| {
            folder_name.as_ref().and_then(|fname| {
                worktrees
                    .iter()
                    .flatten()
                    .find(|name| *name == fname.as_str())
                    .map(|s| s.to_string())
            })
        });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune_result = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune_result {
                    clog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        if let Some(ref name) = worktree_name {
            self.cleanup_worktree_admin_dir(name);
        }
        if let Some(ref fname) = folder_name {
            self.cleanup_worktree_admin_dir(fname);
        }

        // Re-scan and prune any references whose directory is gone.
        drop(repo);
        if let Ok(repo) = self.repo() {
            if let Ok(worktrees) = repo.worktrees() {
                for name in worktrees.iter().flatten() {
                    if let Ok(wt) = repo.find_worktree(name) {
                        if !wt.path().exists() {
                            clog_debug!("Pruning stale worktree reference: {}", name);
                            let _ = wt.prune(Some(
                                git2::WorktreePruneOptions::new()
                                    .valid(true)
                                    .working_tree(true)
                                    .locked(true),
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn cleanup_worktree_admin_dir(&self, worktree_name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.path().join("worktrees").join(worktree_name);
            if admin_dir.exists() {
                clog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Stage everything in a worktree and commit it.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<()> {
        clog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = self.signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        clog_debug!("Commit created: {}", commit_id);
        Ok(())
    }

    fn signature(&self, repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Cascade", "cascade@localhost"))?)
    }

    /// Merge a task branch into `target_branch`.
    ///
    /// Fast-forwards when possible, otherwise creates a merge commit.
    /// On conflict the merge is fully rolled back (state cleanup plus a
    /// hard reset to the pre-merge commit) and the conflicting paths are
    /// returned in the error; the repository is left exactly as found.
    pub fn merge_branch(&self, branch: &str, target_branch: &str) -> Result<String> {
        clog_debug!(
            "GitOps::merge_branch branch={} target={}",
            branch,
            target_branch
        );
        let repo = self.repo()?;

        let source = repo.find_branch(branch, git2::BranchType::Local)?;
        let source_commit = source.get().peel_to_commit()?;

        let target_ref = match repo.find_branch(target_branch, git2::BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let head_commit = repo.head()?.peel_to_commit()?;
                repo.branch(target_branch, &head_commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let target_reference = target_ref.into_reference();
        let target_commit = target_reference.peel_to_commit()?;

        repo.checkout_tree(target_commit.as_object(), None)?;
        repo.set_head(
            target_reference
                .name()
                .unwrap_or(&format!("refs/heads/{}", target_branch)),
        )?;

        let annotated = repo.find_annotated_commit(source_commit.id())?;
        let (analysis, _preference) = repo.merge_analysis(&[&annotated])?;

        if analysis.is_up_to_date() {
            return Ok(target_commit.id().to_string());
        }

        if analysis.is_fast_forward() {
            let refname = format!("refs/heads/{}", target_branch);
            repo.reference(
                &refname,
                source_commit.id(),
                true,
                &format!("Fast-forward merge from {}", branch),
            )?;
            repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;
            return Ok(source_commit.id().to_string());
        }

        let mut merge_opts = MergeOptions::new();
        repo.merge(&[&annotated], Some(&mut merge_opts), None)?;

        let index = repo.index()?;
        if index.has_conflicts() {
            let files = Self::conflicting_paths(&repo)?;
            let _ = repo.cleanup_state();
            // Restore the working tree to the pre-merge target commit.
            repo.reset(target_commit.as_object(), ResetType::Hard, None)?;
            clog_warn!(
                "Merge of {} into {} hit {} conflict(s), rolled back",
                branch,
                target_branch,
                files.len()
            );
            return Err(Error::MergeConflict { files });
        }

        let sig = self.signature(&repo)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let message = format!("Merge {} into {}", branch, target_branch);

        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        repo.cleanup_state()?;

        clog_debug!("Merge commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    fn conflicting_paths(repo: &Repository) -> Result<Vec<PathBuf>> {
        let index = repo.index()?;
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict
                .our
                .as_ref()
                .or(conflict.their.as_ref())
                .or(conflict.ancestor.as_ref());
            if let Some(entry) = entry {
                paths.push(PathBuf::from(String::from_utf8_lossy(&entry.path).to_string()));
            }
        }
        Ok(paths)
    }

    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = repo.find_branch(branch, git2::BranchType::Local);
        match found {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a local branch. Missing branches are fine; other failures
    /// are logged and swallowed since the worktree is already gone.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        clog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    clog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                clog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => {
                clog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// List local branches in the engine's namespace.
    pub fn list_task_branches(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut names = Vec::new();
        for branch in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            if let Ok(Some(name)) = branch.name() {
                if name.starts_with(BRANCH_PREFIX) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    /// Whether a worktree has staged or unstaged changes.
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Prune administrative files for worktrees whose directories are
    /// gone. Run after removing worktree directories directly.
    pub fn prune_worktrees(&self) -> Result<()> {
        clog_debug!("GitOps::prune_worktrees");
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        for worktree_name in worktrees.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(worktree_name) {
                if !worktree.path().exists() {
                    let _ = worktree.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    ));
                }
            }
        }

        Ok(())
    }
}
