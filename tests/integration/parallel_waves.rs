//! Parallel execution correctness tests.
//!
//! Waves, workspace isolation between concurrent tasks, and the
//! concurrency throttle.

use cascade::{EngineEvent, TaskStatus};

use crate::fixtures::{chain_tasks, engine, independent_tasks, status_of, TestRepo, OK_WORKER};

/// Independent tasks all land in wave 0 and all complete.
#[tokio::test]
async fn test_independent_tasks_share_one_wave() {
    let repo = TestRepo::new();
    let config = repo.config_with_worker(OK_WORKER);
    let (mut orch, mut rx) = engine(&repo, independent_tasks(4), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 4);

    let mut wave_starts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let EngineEvent::WaveStarted { wave, task_ids } = event {
            wave_starts.push((wave, task_ids.len()));
        }
    }
    assert_eq!(wave_starts, vec![(0, 4)]);
}

/// With a limit of 2, no more than two workers are ever alive at once.
/// Each worker grabs one of two mkdir slots; a third concurrent worker
/// would find both taken and fail its task.
#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let repo = TestRepo::new();
    let body = format!(
        "\
if mkdir {root}/slot1 2>/dev/null; then slot={root}/slot1
elif mkdir {root}/slot2 2>/dev/null; then slot={root}/slot2
else exit 1
fi
sleep 0.3
rmdir $slot
echo \"done $1\" > out-$1.txt
",
        root = repo.root.display()
    );
    let mut config = repo.config_with_worker(&body);
    config.max_parallel_sessions = 2;
    let (mut orch, _rx) = engine(&repo, independent_tasks(5), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 5);
    assert_eq!(progress.failed, 0);
}

/// A dependent task's workspace already contains its dependency's
/// merged output when the worker starts.
#[tokio::test]
async fn test_dependent_sees_dependency_output() {
    let repo = TestRepo::new();
    let worker = "\
if [ \"$1\" != \"t0\" ]; then
  prev=$(( ${1#t} - 1 ))
  [ -f out-t$prev.txt ] || exit 1
fi
echo \"done $1\" > out-$1.txt
";
    let config = repo.config_with_worker(worker);
    let (mut orch, _rx) = engine(&repo, chain_tasks(3), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 3);
    for id in ["t0", "t1", "t2"] {
        assert_eq!(status_of(&orch, id).await, TaskStatus::Completed);
    }
}

/// Concurrent tasks write the same relative path without clobbering
/// each other; isolation means both files survive to their branches and
/// both merges land distinct content.
#[tokio::test]
async fn test_workspace_isolation_under_parallelism() {
    let repo = TestRepo::new();
    let worker = "echo \"owner $1\" > out-$1.txt\nsleep 0.2\n[ \"$(cat out-$1.txt)\" = \"owner $1\" ] || exit 1\n";
    let mut config = repo.config_with_worker(worker);
    config.max_parallel_sessions = 4;
    let (mut orch, _rx) = engine(&repo, independent_tasks(4), config);

    let progress = orch.run().await.unwrap();
    assert_eq!(progress.completed, 4);
    for i in 0..4 {
        let file = format!("out-t{}.txt", i);
        assert!(repo.merged(&file));
        let contents = std::fs::read_to_string(repo.repo_path().join(&file)).unwrap();
        assert_eq!(contents.trim(), format!("owner t{}", i));
    }
}
