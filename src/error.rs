use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task {task} depends on unknown task {missing}")]
    MissingDependency { task: String, missing: String },

    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Workspace already exists for task {0}")]
    WorkspaceExists(String),

    #[error("No workspace tracked for task {0}")]
    WorkspaceNotFound(String),

    #[error("Failed to create workspace for task {task}: {reason}")]
    WorkspaceCreateFailed { task: String, reason: String },

    #[error("Failed to remove workspace for task {task}: {reason}")]
    WorkspaceRemoveFailed { task: String, reason: String },

    #[error("Merge conflict in {} file(s)", files.len())]
    MergeConflict { files: Vec<PathBuf> },

    #[error("Failed to spawn worker: {0}")]
    SessionSpawnFailed(String),

    #[error("Session timed out after {0:?}")]
    SessionTimeout(std::time::Duration),

    #[error("Worker exited with {0}")]
    NonZeroExit(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is not running: {0}")]
    SessionNotRunning(String),

    #[error("State snapshot version {found} does not match expected {expected}")]
    StateVersionMismatch { expected: u32, found: u32 },

    #[error("State snapshot is corrupt: {0}")]
    CorruptSnapshot(String),

    #[error("Worker not available: {0}")]
    WorkerNotAvailable(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Stable machine-readable code for cross-process transport.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Git(_) => "git",
            Error::Json(_) => "json",
            Error::TomlParse(_) => "toml_parse",
            Error::TomlSerialize(_) => "toml_serialize",
            Error::NoHomeDir => "no_home_dir",
            Error::Validation(_) => "validation",
            Error::MissingDependency { .. } => "analysis.missing_dependency",
            Error::DependencyCycle { .. } => "analysis.cycle",
            Error::WorkspaceExists(_) => "workspace.already_exists",
            Error::WorkspaceNotFound(_) => "workspace.not_found",
            Error::WorkspaceCreateFailed { .. } => "workspace.create_failed",
            Error::WorkspaceRemoveFailed { .. } => "workspace.remove_failed",
            Error::MergeConflict { .. } => "workspace.merge_conflict",
            Error::SessionSpawnFailed(_) => "session.create_failed",
            Error::SessionTimeout(_) => "session.timeout",
            Error::NonZeroExit(_) => "session.non_zero_exit",
            Error::SessionNotFound(_) => "session.not_found",
            Error::SessionNotRunning(_) => "session.not_running",
            Error::StateVersionMismatch { .. } => "state.version_mismatch",
            Error::CorruptSnapshot(_) => "state.corrupt_snapshot",
            Error::WorkerNotAvailable(_) => "worker_not_available",
            Error::Timeout(_) => "timeout",
            Error::TaskJoin(_) => "task_join",
        }
    }

    /// Structured detail payload alongside `code()`, suitable for handing to
    /// the presentation layer over a process boundary.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            Error::MissingDependency { task, missing } => serde_json::json!({
                "task": task,
                "missing": missing,
            }),
            Error::DependencyCycle { cycle } => serde_json::json!({ "cycle": cycle }),
            Error::MergeConflict { files } => serde_json::json!({ "files": files }),
            Error::StateVersionMismatch { expected, found } => serde_json::json!({
                "expected": expected,
                "found": found,
            }),
            Error::WorkspaceCreateFailed { task, reason }
            | Error::WorkspaceRemoveFailed { task, reason } => serde_json::json!({
                "task": task,
                "reason": reason,
            }),
            other => serde_json::json!({ "message": other.to_string() }),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
