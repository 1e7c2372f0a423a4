//! Cascade: parallel task execution over git worktrees.
//!
//! A task list with dependencies is resolved into waves, each task runs
//! in its own isolated workspace under an external worker process, and
//! finished work is merged back into the target branch. Execution state
//! is snapshotted so interrupted runs can resume.

pub mod buffer;
pub mod config;
pub mod error;
pub mod events;
pub mod git;
pub mod log;
pub mod orchestrator;
pub mod plan;
pub mod session;
pub mod state;
pub mod task;
pub mod throttle;
pub mod util;
pub mod workspace;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EngineEvent, Progress, ProgressReporter};
pub use orchestrator::{EngineController, EnginePaths, Orchestrator};
pub use plan::{ExecutionPlan, Resolver, Wave};
pub use session::{SessionHandle, SessionId, SessionSpec, SessionStatus};
pub use state::{ExecutionState, StateStore};
pub use task::{Task, TaskId, TaskStatus};
pub use throttle::ConcurrencyThrottle;
pub use workspace::WorkspaceManager;
