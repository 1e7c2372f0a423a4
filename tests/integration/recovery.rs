//! Crash recovery and resume tests.

use std::time::Duration;

use cascade::{Error, Orchestrator, ProgressReporter, StateStore, TaskId, TaskStatus};

use crate::fixtures::{chain_tasks, engine, status_of, TestRepo, OK_WORKER};

/// Stop a running execution, then resume it in a new engine. The
/// stopped task runs again and the execution finishes.
#[tokio::test]
async fn test_stop_then_resume_completes() {
    let repo = TestRepo::new();
    // First run: the worker never finishes.
    let config = repo.config_with_worker("sleep 30\n");
    let (mut orch, _rx) = engine(&repo, chain_tasks(2), config.clone());
    let controller = orch.controller();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.stop_execution();
    });
    let progress = orch.run().await.unwrap();
    assert!(!progress.is_done());
    drop(orch);

    // Second run: swap in a worker that succeeds, resume from the
    // snapshot the stop wrote.
    let config = repo.config_with_worker(OK_WORKER);
    let (reporter, _rx) = ProgressReporter::channel(1024);
    let mut resumed = Orchestrator::resume(config, repo.paths(), reporter).unwrap();

    let progress = resumed.run().await.unwrap();
    assert!(progress.is_done());
    assert_eq!(progress.completed, 2);
    assert!(repo.merged("out-t0.txt"));
    assert!(repo.merged("out-t1.txt"));
}

/// A crash mid-session leaves a task Running in the snapshot. Resume
/// treats it as not run, reruns it, and does not rerun completed work.
#[tokio::test]
async fn test_resume_reruns_only_incomplete_tasks() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (orch, _rx) = engine(&repo, chain_tasks(2), config.clone());

    // Fabricate the post-crash snapshot: t0 done, t1 mid-flight.
    let store = StateStore::new(repo.root.join("state.json"));
    {
        let state = orch.state();
        let mut state = state.write().await;
        state.task_mut(&TaskId::from("t0")).unwrap().complete();
        state.task_mut(&TaskId::from("t1")).unwrap().start();
        store.save(&state).unwrap();
    }
    drop(orch);

    let (reporter, _rx) = ProgressReporter::channel(1024);
    let mut resumed = Orchestrator::resume(config, repo.paths(), reporter).unwrap();
    assert_eq!(status_of(&resumed, "t1").await, TaskStatus::Pending);

    let progress = resumed.run().await.unwrap();
    assert!(progress.is_done());
    assert_eq!(status_of(&resumed, "t0").await, TaskStatus::Completed);
    assert_eq!(status_of(&resumed, "t1").await, TaskStatus::Completed);
    // t0 never actually ran, so its output never existed.
    assert!(!repo.merged("out-t0.txt"));
    assert!(repo.merged("out-t1.txt"));
}

/// An unparseable snapshot refuses to resume instead of silently
/// starting over.
#[tokio::test]
async fn test_corrupt_snapshot_refuses_resume() {
    let repo = TestRepo::new();
    std::fs::write(repo.root.join("state.json"), "{ definitely not json").unwrap();
    let config = repo.config_with_worker(OK_WORKER);
    let (reporter, _rx) = ProgressReporter::channel(8);

    let err = Orchestrator::resume(config, repo.paths(), reporter).unwrap_err();
    assert!(matches!(err, Error::CorruptSnapshot(_)));
}

/// A snapshot written by a different schema version is rejected.
#[tokio::test]
async fn test_version_mismatch_refuses_resume() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (orch, _rx) = engine(&repo, chain_tasks(1), config.clone());

    let store = StateStore::new(repo.root.join("state.json"));
    {
        let state = orch.state();
        let mut state = state.write().await;
        state.version += 1;
        store.save(&state).unwrap();
    }
    drop(orch);

    let (reporter, _rx) = ProgressReporter::channel(8);
    let err = Orchestrator::resume(config, repo.paths(), reporter).unwrap_err();
    assert!(matches!(err, Error::StateVersionMismatch { .. }));
}

/// Resume reattaches surviving workspaces instead of recreating them,
/// keeping committed partial work.
#[tokio::test]
async fn test_resume_reconciles_workspaces() {
    let repo = TestRepo::new();
    // Worker commits nothing but the engine commits its file on
    // success; first run is stopped before the slow task finishes.
    let config = repo.config_with_worker("echo started > progress.txt\nsleep 30\n");
    let (mut orch, _rx) = engine(&repo, chain_tasks(1), config);
    let controller = orch.controller();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.stop_execution();
    });
    orch.run().await.unwrap();
    drop(orch);

    // The workspace from the stopped run is still there.
    let workspace = repo.root.join("workspaces/t0");
    assert!(workspace.exists());

    let config = repo.config_with_worker(OK_WORKER);
    let (reporter, _rx) = ProgressReporter::channel(1024);
    let mut resumed = Orchestrator::resume(config, repo.paths(), reporter).unwrap();
    let progress = resumed.run().await.unwrap();

    assert!(progress.is_done());
    assert_eq!(progress.completed, 1);
    // The rerun happened in the same reattached workspace, so the
    // first attempt's leftover file was committed along with the new
    // output.
    assert!(repo.merged("out-t0.txt"));
    assert!(repo.merged("progress.txt"));
}
