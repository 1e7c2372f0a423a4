//! The execution engine.
//!
//! Drives a planned task set to completion: waves run in order, tasks
//! within a wave run concurrently under the throttle, each task in its
//! own workspace with its own worker session. Completed work is
//! committed and merged into the target branch; failures skip the
//! dependent subtree and the rest of the execution continues.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{EngineEvent, Progress, ProgressReporter};
use crate::plan::{Resolver, Wave};
use crate::session::{SessionHandle, SessionSpec, SessionStatus};
use crate::state::{ExecutionState, SessionRecord, StateStore};
use crate::task::{Task, TaskId, TaskStatus};
use crate::throttle::ConcurrencyThrottle;
use crate::workspace::WorkspaceManager;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Where one execution keeps its repo, workspaces, logs, and snapshot.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub repo_path: PathBuf,
    pub workspaces_dir: PathBuf,
    pub log_dir: PathBuf,
    pub state_path: PathBuf,
}

impl EnginePaths {
    /// Standard locations under ~/.cascade for a given repo.
    pub fn from_config(config: &Config, repo_path: PathBuf) -> Result<Self> {
        Ok(Self {
            repo_path,
            workspaces_dir: config.workspaces_dir()?,
            log_dir: Config::session_logs_dir()?,
            state_path: Config::state_path()?,
        })
    }
}

/// Cloneable remote control for a running execution.
#[derive(Clone)]
pub struct EngineController {
    cancel: CancellationToken,
    sessions: Arc<tokio::sync::Mutex<HashMap<TaskId, SessionHandle>>>,
}

impl EngineController {
    /// Stop the whole execution. Running workers get a graceful stop;
    /// unstarted tasks stay pending for a later resume.
    pub fn stop_execution(&self) {
        clog!("Execution stop requested");
        self.cancel.cancel();
    }

    /// Stop the session currently bound to one task.
    pub async fn stop_session(&self, task_id: &TaskId) -> Result<()> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(task_id)
            .ok_or_else(|| Error::SessionNotFound(task_id.to_string()))?;
        handle.stop();
        Ok(())
    }

    /// Forward a line to a task's worker stdin.
    pub async fn send_to_session(&self, task_id: &TaskId, line: &str) -> Result<()> {
        let handle = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(task_id)
                .cloned()
                .ok_or_else(|| Error::SessionNotFound(task_id.to_string()))?
        };
        handle.send(line).await
    }

    /// Buffered output of a task's latest session.
    pub async fn session_output(&self, task_id: &TaskId) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions.get(task_id).map(|h| h.output())
    }
}

/// Owns one execution end to end.
pub struct Orchestrator {
    config: Config,
    resolver: Resolver,
    workspaces: WorkspaceManager,
    throttle: ConcurrencyThrottle,
    store: Arc<StateStore>,
    state: Arc<RwLock<ExecutionState>>,
    reporter: ProgressReporter,
    sessions: Arc<tokio::sync::Mutex<HashMap<TaskId, SessionHandle>>>,
    cancel: CancellationToken,
    /// Resolved worker executable.
    worker: PathBuf,
    /// Arguments from the configured worker command, before the task id.
    worker_args: Vec<String>,
    log_dir: PathBuf,
    target_branch: String,
}

impl Orchestrator {
    /// Plan a fresh execution over `tasks`.
    pub fn new(
        config: Config,
        tasks: Vec<Task>,
        paths: EnginePaths,
        reporter: ProgressReporter,
    ) -> Result<Self> {
        let resolver = Resolver::new(&tasks)?;
        let plan = resolver.plan()?;
        let workspaces = WorkspaceManager::new(&paths.repo_path, paths.workspaces_dir.clone())?;
        let target_branch = workspaces.git().current_head()?;
        let state = ExecutionState::new(plan, tasks, target_branch.clone());
        Self::build(config, resolver, workspaces, state, paths, reporter, target_branch)
    }

    /// Pick up a previous execution from its snapshot.
    ///
    /// Tasks left Running by a crash have no live worker behind them, so
    /// they drop back to Pending and run again. Failed and Skipped tasks
    /// keep their verdicts; rerunning those takes an explicit retry.
    pub fn resume(
        config: Config,
        paths: EnginePaths,
        reporter: ProgressReporter,
    ) -> Result<Self> {
        let store = StateStore::new(paths.state_path.clone());
        let mut state = store
            .load()?
            .ok_or_else(|| Error::Validation("No saved execution state to resume".to_string()))?;

        for task in &mut state.tasks {
            if task.status == TaskStatus::Running {
                clog!("Resume: task {} was running at crash, back to pending", task.id);
                task.status = TaskStatus::Pending;
            }
        }

        let resolver = Resolver::new(&state.tasks)?;
        let mut workspaces =
            WorkspaceManager::new(&paths.repo_path, paths.workspaces_dir.clone())?;
        let reconciled = workspaces.reconcile()?;
        clog!(
            "Resume: {} task(s) remaining, {} workspace(s) reconciled",
            state.remaining_tasks().len(),
            reconciled
        );

        let target_branch = state.target_branch.clone();
        Self::build(config, resolver, workspaces, state, paths, reporter, target_branch)
    }

    fn build(
        config: Config,
        resolver: Resolver,
        workspaces: WorkspaceManager,
        state: ExecutionState,
        paths: EnginePaths,
        reporter: ProgressReporter,
        target_branch: String,
    ) -> Result<Self> {
        let worker = config.resolve_worker()?;
        let worker_args: Vec<String> = config
            .effective_worker_command()
            .split_whitespace()
            .skip(1)
            .map(str::to_string)
            .collect();
        if !paths.log_dir.exists() {
            std::fs::create_dir_all(&paths.log_dir)?;
        }
        let throttle = ConcurrencyThrottle::new(&config);
        Ok(Self {
            config,
            resolver,
            workspaces,
            throttle,
            store: Arc::new(StateStore::new(paths.state_path)),
            state: Arc::new(RwLock::new(state)),
            reporter,
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            worker,
            worker_args,
            log_dir: paths.log_dir,
            target_branch,
        })
    }

    pub fn controller(&self) -> EngineController {
        EngineController {
            cancel: self.cancel.clone(),
            sessions: self.sessions.clone(),
        }
    }

    pub fn state(&self) -> Arc<RwLock<ExecutionState>> {
        self.state.clone()
    }

    /// Run the execution to its end (or until stopped). Returns the
    /// final progress; individual task failures are recorded in state,
    /// not surfaced as errors.
    pub async fn run(&mut self) -> Result<Progress> {
        let plan = self.state.read().await.plan.clone();
        clog!(
            "Execution starting: {} task(s) in {} wave(s), target branch {}",
            plan.total_tasks,
            plan.waves.len(),
            self.target_branch
        );
        self.reporter.emit(EngineEvent::ExecutionStarted {
            total_tasks: plan.total_tasks,
            wave_count: plan.waves.len(),
        });
        self.snapshot().await?;

        let autosave_cancel = CancellationToken::new();
        let autosave = self.store.spawn_autosave(
            self.state.clone(),
            Duration::from_millis(self.config.state_autosave_interval_ms.max(100)),
            autosave_cancel.clone(),
        );

        let mut stopped = false;
        for wave in &plan.waves {
            {
                let mut state = self.state.write().await;
                state.current_wave = wave.index;
            }
            self.store.mark_dirty();
            if !self.run_wave(wave).await? {
                stopped = true;
                break;
            }
        }

        autosave_cancel.cancel();
        if let Err(e) = autosave.await {
            clog_warn!("Autosave task join failed: {}", e);
        }
        self.snapshot().await?;

        let progress = self.state.read().await.progress();
        // Held-back tasks leave the run short of done without a full
        // stop; that still ends as stopped, not completed.
        if stopped || !progress.is_done() {
            clog!("Execution stopped at {:.0}%", progress.percentage);
            self.reporter.emit(EngineEvent::ExecutionStopped);
        } else {
            clog!(
                "Execution completed: {} ok, {} failed, {} skipped",
                progress.completed,
                progress.failed,
                progress.skipped
            );
            self.reporter.emit(EngineEvent::ExecutionCompleted {
                progress: progress.clone(),
            });
        }
        Ok(progress)
    }

    /// Run one wave to quiescence. Returns false if the execution was
    /// stopped mid-wave.
    async fn run_wave(&mut self, wave: &Wave) -> Result<bool> {
        // Tasks already terminal (resumed runs, subtrees skipped by an
        // earlier wave's failure) are not dispatched again.
        let mut queue: VecDeque<TaskId> = {
            let state = self.state.read().await;
            wave.task_ids
                .iter()
                .filter(|id| {
                    state
                        .task(id)
                        .map(|t| t.status == TaskStatus::Pending)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if queue.is_empty() {
            clog_debug!("Wave {}: nothing to run", wave.index);
            return Ok(true);
        }

        clog!("Wave {} starting: {} task(s)", wave.index, queue.len());
        self.reporter.emit(EngineEvent::WaveStarted {
            wave: wave.index,
            task_ids: queue.iter().cloned().collect(),
        });

        let mut running: HashMap<TaskId, SessionHandle> = HashMap::new();
        let mut attempts: HashMap<TaskId, u32> = HashMap::new();

        loop {
            while !queue.is_empty() && self.throttle.is_slot_available(running.len()) {
                let task_id = queue.pop_front().unwrap();
                // A dependency from an earlier wave can sit non-terminal
                // if the operator stopped its session. Launching anyway
                // would hand the worker a workspace missing that output,
                // so the task is held back and stays pending for resume.
                if let Some(dep) = self.unfinished_dependency(&task_id).await {
                    clog!(
                        "Task {} held back: dependency {} has not completed",
                        task_id,
                        dep
                    );
                    continue;
                }
                let attempt = *attempts.get(&task_id).unwrap_or(&0);
                match self.launch(&task_id, attempt).await {
                    Ok(handle) => {
                        running.insert(task_id, handle);
                    }
                    Err(e) => {
                        clog_warn!("Task {} could not start: {}", task_id, e);
                        self.fail_task(&task_id, &e.to_string()).await;
                        self.skip_dependents(&task_id).await;
                    }
                }
            }
            if running.is_empty() && queue.is_empty() {
                break;
            }

            let waiters: Vec<_> = running
                .values()
                .cloned()
                .map(|h| {
                    Box::pin(async move {
                        let task_id = h.task_id().clone();
                        let session_id = h.id();
                        let status = h.wait_for_completion().await;
                        (task_id, session_id, status)
                    })
                })
                .collect();

            let cancel = self.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.halt_running(&mut running).await;
                    return Ok(false);
                }
                ((task_id, session_id, status), _, _) = futures::future::select_all(waiters) => {
                    running.remove(&task_id);
                    {
                        let mut state = self.state.write().await;
                        state.update_session(session_id, status.clone());
                    }
                    self.store.mark_dirty();

                    match status {
                        SessionStatus::Completed => {
                            self.finish_task(&task_id).await;
                        }
                        SessionStatus::Failed { error } => {
                            let attempt = attempts.entry(task_id.clone()).or_insert(0);
                            if self.config.auto_retry && *attempt < self.config.retry_count {
                                *attempt += 1;
                                clog!(
                                    "Task {} failed ({}), retry {}/{}",
                                    task_id, error, attempt, self.config.retry_count
                                );
                                // Back to pending; the workspace survives
                                // so the retry keeps partial work.
                                self.set_status(&task_id, TaskStatus::Pending).await;
                                queue.push_back(task_id);
                            } else {
                                self.fail_task(&task_id, &error).await;
                                self.skip_dependents(&task_id).await;
                            }
                        }
                        SessionStatus::Cancelled => {
                            // Operator stopped a single session; the task
                            // did not fail, it just has not run yet.
                            self.set_status(&task_id, TaskStatus::Pending).await;
                        }
                        SessionStatus::Idle | SessionStatus::Running => {
                            clog_warn!(
                                "Session {} for {} ended non-terminal: {}",
                                session_id.short(), task_id, status
                            );
                            self.fail_task(&task_id, "session ended without a verdict").await;
                            self.skip_dependents(&task_id).await;
                        }
                    }
                }
            }
        }

        clog!("Wave {} complete", wave.index);
        self.reporter.emit(EngineEvent::WaveCompleted { wave: wave.index });
        Ok(true)
    }

    /// Spawn a worker session for one task in its workspace.
    async fn launch(&mut self, task_id: &TaskId, attempt: u32) -> Result<SessionHandle> {
        let workdir = self.workspaces.ensure(task_id, None)?.path.clone();
        let mut args = self.worker_args.clone();
        args.push(task_id.to_string());

        let mut spec = SessionSpec::new(
            task_id.clone(),
            self.worker.clone(),
            workdir,
            self.log_dir.clone(),
        )
        .with_args(args)
        .with_timeout(self.config.session_timeout());
        spec.output_buffer_bytes = self.config.output_buffer_bytes;

        let handle = SessionHandle::spawn(spec, self.reporter.clone()).await?;
        {
            let mut state = self.state.write().await;
            state.record_session(SessionRecord {
                session_id: handle.id(),
                task_id: task_id.clone(),
                status: SessionStatus::Running,
                started_at: handle.started_at(),
                finished_at: None,
                attempt,
            });
            if let Some(task) = state.task_mut(task_id) {
                task.start();
            }
        }
        self.store.mark_dirty();
        self.reporter.task_status(task_id, &TaskStatus::Running);
        self.sessions
            .lock()
            .await
            .insert(task_id.clone(), handle.clone());
        Ok(handle)
    }

    /// Commit and merge a successful task's work, then mark it done.
    /// A merge conflict is a task failure, not an engine failure.
    async fn finish_task(&mut self, task_id: &TaskId) {
        let title = self
            .state
            .read()
            .await
            .task(task_id)
            .map(|t| t.title.clone())
            .unwrap_or_default();

        let merged = self
            .workspaces
            .commit_work(task_id, &format!("{}: {}", task_id, title))
            .and_then(|_| self.workspaces.merge(task_id, &self.target_branch));

        match merged {
            Ok(commit) => {
                clog!("Task {} merged into {} ({})", task_id, self.target_branch, commit);
                self.transition(task_id, |t| t.complete()).await;
                if self.config.auto_cleanup_on_success {
                    if let Err(e) = self.workspaces.remove(task_id, true) {
                        clog_warn!("Cleanup of {} workspace failed: {}", task_id, e);
                    }
                }
            }
            Err(e) => {
                clog_warn!("Task {} work could not be merged: {}", task_id, e);
                self.fail_task(task_id, &e.to_string()).await;
                self.skip_dependents(task_id).await;
            }
        }
    }

    async fn fail_task(&self, task_id: &TaskId, error: &str) {
        let error = error.to_string();
        self.transition(task_id, move |t| t.fail(&error)).await;
    }

    /// First dependency of `task_id` that has not completed, if any.
    /// Such a task must not launch; its workspace would branch from a
    /// target missing the dependency's merged output.
    async fn unfinished_dependency(&self, task_id: &TaskId) -> Option<TaskId> {
        let state = self.state.read().await;
        self.resolver
            .dependencies_of(task_id)
            .into_iter()
            .find(|dep| {
                state
                    .task(dep)
                    .map(|t| t.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
    }

    /// Everything downstream of a failed task will never have its
    /// dependencies satisfied; skip the whole subtree now.
    async fn skip_dependents(&self, task_id: &TaskId) {
        for dependent in self.resolver.transitive_dependents_of(task_id) {
            let already_terminal = self
                .state
                .read()
                .await
                .task(&dependent)
                .map(|t| t.is_terminal())
                .unwrap_or(true);
            if already_terminal {
                continue;
            }
            let reason = format!("dependency {} failed", task_id);
            clog!("Skipping {}: {}", dependent, reason);
            self.transition(&dependent, move |t| t.skip(&reason)).await;
        }
    }

    /// Stop and drain every running session after an execution stop.
    /// Workers that beat the stop to a clean exit still get merged.
    async fn halt_running(&mut self, running: &mut HashMap<TaskId, SessionHandle>) {
        clog!("Stopping {} running session(s)", running.len());
        for handle in running.values() {
            handle.stop();
        }
        for (task_id, handle) in running.drain() {
            let status = handle.wait_for_completion().await;
            {
                let mut state = self.state.write().await;
                state.update_session(handle.id(), status.clone());
            }
            match status {
                SessionStatus::Completed => self.finish_task(&task_id).await,
                SessionStatus::Failed { error } => self.fail_task(&task_id, &error).await,
                _ => self.set_status(&task_id, TaskStatus::Pending).await,
            }
        }
        self.store.mark_dirty();
        if let Err(e) = self.snapshot().await {
            clog_warn!("Snapshot after stop failed: {}", e);
        }
    }

    /// Write the current state without blocking the runtime on disk io.
    async fn snapshot(&self) -> Result<()> {
        let store = self.store.clone();
        let snapshot = self.state.read().await.clone();
        crate::util::blocking(move || store.save(&snapshot)).await
    }

    /// Re-run one failed task in its surviving workspace. Dependent
    /// tasks keep whatever verdict they already have.
    pub async fn retry_task(&mut self, task_id: &TaskId) -> Result<TaskStatus> {
        let status = self
            .state
            .read()
            .await
            .task(task_id)
            .map(|t| t.status.clone())
            .ok_or_else(|| Error::Validation(format!("Unknown task: {}", task_id)))?;
        if !matches!(status, TaskStatus::Failed { .. }) {
            return Err(Error::Validation(format!(
                "Task {} is {}, only failed tasks can be retried",
                task_id, status
            )));
        }

        clog!("Manual retry of task {}", task_id);
        self.set_status(task_id, TaskStatus::Pending).await;
        let handle = match self.launch(task_id, 0).await {
            Ok(handle) => handle,
            Err(e) => {
                // Leave the task failed rather than stuck pending.
                self.fail_task(task_id, &e.to_string()).await;
                return Err(e);
            }
        };

        let session_status = handle.wait_for_completion().await;
        {
            let mut state = self.state.write().await;
            state.update_session(handle.id(), session_status.clone());
        }
        match session_status {
            SessionStatus::Completed => self.finish_task(task_id).await,
            SessionStatus::Failed { error } => self.fail_task(task_id, &error).await,
            _ => self.set_status(task_id, TaskStatus::Pending).await,
        }
        self.snapshot().await?;

        Ok(self
            .state
            .read()
            .await
            .task(task_id)
            .map(|t| t.status.clone())
            .unwrap_or(TaskStatus::Pending))
    }

    async fn set_status(&self, task_id: &TaskId, status: TaskStatus) {
        self.transition(task_id, move |t| t.status = status).await;
    }

    /// Apply one task transition, then publish it.
    async fn transition(&self, task_id: &TaskId, f: impl FnOnce(&mut Task)) {
        let (status, progress) = {
            let mut state = self.state.write().await;
            let Some(task) = state.task_mut(task_id) else {
                return;
            };
            f(task);
            let status = task.status.clone();
            state.updated_at = chrono::Utc::now();
            (status, state.progress())
        };
        self.store.mark_dirty();
        self.reporter.task_status(task_id, &status);
        self.reporter.progress(progress);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("worker", &self.worker)
            .field("target_branch", &self.target_branch)
            .field("throttle", &self.throttle)
            .finish()
    }
}
