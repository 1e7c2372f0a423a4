//! Test fixtures for integration tests.
//!
//! Provides a temporary git repository, shell-script worker stand-ins,
//! and predefined task sets.

use std::path::PathBuf;
use std::process::Command;

use tempfile::TempDir;
use tokio::sync::mpsc;

use cascade::{
    Config, EngineEvent, EnginePaths, Orchestrator, ProgressReporter, Task, TaskId, TaskStatus,
};

/// A temporary directory holding a seeded git repository plus room for
/// workspaces, logs, and the state snapshot.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        let repo = root.join("repo");
        std::fs::create_dir_all(&repo).expect("Failed to create repo dir");

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            let output = Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .expect("Failed to run git");
            assert!(output.status.success(), "git {:?} failed", args);
        }

        std::fs::write(repo.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        for args in [vec!["add", "."], vec!["commit", "-m", "Initial commit"]] {
            let output = Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .expect("Failed to run git");
            assert!(output.status.success(), "git {:?} failed", args);
        }

        Self { temp_dir, root }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.root.join("repo")
    }

    pub fn paths(&self) -> EnginePaths {
        EnginePaths {
            repo_path: self.repo_path(),
            workspaces_dir: self.root.join("workspaces"),
            log_dir: self.root.join("logs"),
            state_path: self.root.join("state.json"),
        }
    }

    /// Install a worker script. The engine invokes it as
    /// `sh worker.sh <task_id>` inside the task's workspace.
    pub fn write_worker(&self, body: &str) -> String {
        let script = self.root.join("worker.sh");
        std::fs::write(&script, body).expect("Failed to write worker script");
        format!("/bin/sh {}", script.display())
    }

    pub fn config_with_worker(&self, body: &str) -> Config {
        Config {
            worker_command: Some(self.write_worker(body)),
            session_timeout_seconds: 30,
            state_autosave_interval_ms: 100,
            ..Config::default()
        }
    }

    /// Whether a file landed on the target branch checkout.
    pub fn merged(&self, file: &str) -> bool {
        self.repo_path().join(file).exists()
    }

    /// The repo working tree has no uncommitted or conflicted entries.
    pub fn is_clean(&self) -> bool {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(self.repo_path())
            .output()
            .expect("Failed to run git status");
        output.stdout.is_empty()
    }
}

pub fn engine(
    repo: &TestRepo,
    tasks: Vec<Task>,
    config: Config,
) -> (Orchestrator, mpsc::Receiver<EngineEvent>) {
    let (reporter, rx) = ProgressReporter::channel(1024);
    let orch = Orchestrator::new(config, tasks, repo.paths(), reporter)
        .expect("Failed to build orchestrator");
    (orch, rx)
}

pub async fn status_of(orch: &Orchestrator, id: &str) -> TaskStatus {
    orch.state()
        .read()
        .await
        .task(&TaskId::from(id))
        .expect("unknown task")
        .status
        .clone()
}

/// A worker that records its task id and exits cleanly.
pub const OK_WORKER: &str = "echo \"done $1\" > out-$1.txt\n";

pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| Task::new(format!("t{}", i), &format!("Task {}", i)))
        .collect()
}

pub fn chain_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| {
            if i == 0 {
                Task::new("t0", "Task 0")
            } else {
                let dep = format!("t{}", i - 1);
                Task::with_deps(format!("t{}", i), &format!("Task {}", i), &[dep.as_str()])
            }
        })
        .collect()
}

pub fn diamond_tasks() -> Vec<Task> {
    vec![
        Task::new("a", "Root"),
        Task::with_deps("b", "Left", &["a"]),
        Task::with_deps("c", "Right", &["a"]),
        Task::with_deps("d", "Join", &["b", "c"]),
    ]
}
