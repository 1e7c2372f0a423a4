//! Merge conflict handling and failure propagation.

use cascade::{Task, TaskId, TaskStatus, WorkspaceManager};

use crate::fixtures::{engine, status_of, TestRepo};

/// Two tasks branched from the same commit rewrite the same file. The
/// second merge conflicts; the conflicting task fails, the target
/// branch keeps the first task's version, and the repo is left clean.
#[tokio::test]
async fn test_merge_conflict_fails_task_and_rolls_back() {
    let repo = TestRepo::new();
    let worker = "echo \"from $1\" > README.md\n";
    let mut config = repo.config_with_worker(worker);
    config.max_parallel_sessions = 1;
    let tasks = vec![Task::new("a", "Task a"), Task::new("b", "Task b")];

    // Branch b off the seed commit before a's merge advances the
    // target, so the two edits genuinely diverge.
    let mut workspaces =
        WorkspaceManager::new(&repo.repo_path(), repo.root.join("workspaces")).unwrap();
    workspaces.create(&TaskId::from("b"), None).unwrap();
    drop(workspaces);

    let (mut orch, _rx) = engine(&repo, tasks, config);
    let progress = orch.run().await.unwrap();

    assert_eq!(progress.completed, 1);
    assert_eq!(progress.failed, 1);
    assert_eq!(status_of(&orch, "a").await, TaskStatus::Completed);
    assert!(matches!(
        status_of(&orch, "b").await,
        TaskStatus::Failed { ref error } if error.to_lowercase().contains("conflict")
    ));

    // Rollback left the winner's content and no half-merged state.
    let readme = std::fs::read_to_string(repo.repo_path().join("README.md")).unwrap();
    assert_eq!(readme.trim(), "from a");
    assert!(repo.is_clean());
}

/// A failure skips the whole dependent subtree but nothing else; a
/// later wave still runs its unaffected tasks.
#[tokio::test]
async fn test_failure_skips_subtree_only() {
    let repo = TestRepo::new();
    let worker = "\
if [ \"$1\" = \"build\" ]; then exit 1; fi
echo \"done $1\" > out-$1.txt
";
    let config = repo.config_with_worker(worker);
    let tasks = vec![
        Task::new("schema", "Schema"),
        Task::with_deps("build", "Build", &["schema"]),
        Task::with_deps("test", "Test", &["build"]),
        Task::with_deps("docs", "Docs", &["schema"]),
    ];
    let (mut orch, _rx) = engine(&repo, tasks, config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.skipped, 1);

    assert_eq!(status_of(&orch, "schema").await, TaskStatus::Completed);
    assert_eq!(status_of(&orch, "docs").await, TaskStatus::Completed);
    assert!(matches!(
        status_of(&orch, "build").await,
        TaskStatus::Failed { .. }
    ));
    assert!(matches!(
        status_of(&orch, "test").await,
        TaskStatus::Skipped { ref reason } if reason.contains("build")
    ));
    assert!(repo.merged("out-docs.txt"));
    assert!(!repo.merged("out-build.txt"));
}

/// A failed task's workspace and branch survive so the work can be
/// inspected and retried; a successful task keeps its workspace too
/// unless auto cleanup is on.
#[tokio::test]
async fn test_failed_workspace_kept_for_inspection() {
    let repo = TestRepo::new();
    let worker = "echo \"partial $1\" > notes.txt\nexit 1\n";
    let config = repo.config_with_worker(worker);
    let tasks = vec![Task::new("a", "Task a")];
    let (mut orch, _rx) = engine(&repo, tasks, config);
    orch.run().await.unwrap();

    let workspace = repo.root.join("workspaces/a");
    assert!(workspace.join("notes.txt").exists());
    let contents = std::fs::read_to_string(workspace.join("notes.txt")).unwrap();
    assert_eq!(contents.trim(), "partial a");
}
