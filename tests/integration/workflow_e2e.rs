//! Full workflow execution tests.
//!
//! Plan a task set, run it, and verify that every task's work ends up
//! merged on the target branch with the right final state.

use cascade::{StateStore, TaskStatus};

use crate::fixtures::{diamond_tasks, engine, independent_tasks, status_of, TestRepo, OK_WORKER};

/// Diamond graph: the join task must see both sides' merged output in
/// its own workspace, proving dependencies land before dependents run.
#[tokio::test]
async fn test_diamond_workflow_merges_in_dependency_order() {
    let repo = TestRepo::new();
    let worker = "\
if [ \"$1\" = \"d\" ]; then
  [ -f out-b.txt ] || exit 1
  [ -f out-c.txt ] || exit 1
fi
echo \"done $1\" > out-$1.txt
";
    let config = repo.config_with_worker(worker);
    let (mut orch, _rx) = engine(&repo, diamond_tasks(), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 4);
    assert!(progress.is_done());
    for file in ["out-a.txt", "out-b.txt", "out-c.txt", "out-d.txt"] {
        assert!(repo.merged(file), "{} missing from target branch", file);
    }
    assert!(repo.is_clean());
}

#[tokio::test]
async fn test_empty_task_list_completes_immediately() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (mut orch, _rx) = engine(&repo, Vec::new(), config);

    let progress = orch.run().await.unwrap();
    assert!(progress.is_done());
    assert_eq!(progress.total, 0);
    assert!((progress.percentage - 100.0).abs() < f64::EPSILON);
}

/// The snapshot on disk after a run is a complete record: terminal
/// task statuses, terminal session records, and a loadable version.
#[tokio::test]
async fn test_final_snapshot_is_complete() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (mut orch, _rx) = engine(&repo, independent_tasks(3), config);
    orch.run().await.unwrap();

    let store = StateStore::new(repo.root.join("state.json"));
    let state = store.load().unwrap().expect("snapshot missing");
    assert!(state.is_complete());
    assert!(!state.has_incomplete_execution());
    assert_eq!(state.sessions.len(), 3);
    for record in &state.sessions {
        assert!(record.status.is_terminal());
        assert!(record.finished_at.is_some());
    }
}

/// Task timestamps move forward through the lifecycle.
#[tokio::test]
async fn test_task_timing_recorded() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (mut orch, _rx) = engine(&repo, independent_tasks(1), config);
    orch.run().await.unwrap();

    assert_eq!(status_of(&orch, "t0").await, TaskStatus::Completed);
    let state = orch.state();
    let state = state.read().await;
    let task = state.task(&cascade::TaskId::from("t0")).unwrap();
    assert!(task.started_at.unwrap() >= task.created_at);
    assert!(task.completed_at.unwrap() >= task.started_at.unwrap());
}

/// A worker that overruns the session timeout fails the task with a
/// timeout error rather than hanging the execution.
#[tokio::test]
async fn test_session_timeout_fails_task() {
    let repo = TestRepo::new();
    let mut config = repo.config_with_worker("sleep 30\n");
    config.session_timeout_seconds = 1;
    let (mut orch, _rx) = engine(&repo, independent_tasks(1), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.failed, 1);
    assert!(matches!(
        status_of(&orch, "t0").await,
        TaskStatus::Failed { ref error } if error.contains("timed out")
    ));
}
