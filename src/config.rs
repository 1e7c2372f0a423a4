use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{clog_debug, Error, Result};

/// Upper bound on parallel sessions, regardless of configuration.
pub const HARD_SESSION_CAP: usize = 10;

fn default_max_parallel() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_retry_count() -> u32 {
    1
}

fn default_memory_budget_mb() -> u64 {
    1024
}

fn default_autosave_interval_ms() -> u64 {
    2000
}

fn default_output_buffer_bytes() -> usize {
    256 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Maximum sessions running at once (clamped to 1..=10).
    #[serde(default = "default_max_parallel")]
    pub max_parallel_sessions: usize,
    /// Per-session wall-clock limit; 0 disables the limit.
    #[serde(default = "default_timeout_secs")]
    pub session_timeout_seconds: u64,
    #[serde(default)]
    pub auto_retry: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default)]
    pub auto_cleanup_on_success: bool,
    /// The opaque external worker executable.
    pub worker_command: Option<String>,
    pub workspace_dir: Option<String>,
    /// Memory the throttle budgets per session when deriving its resource cap.
    #[serde(default = "default_memory_budget_mb")]
    pub session_memory_budget_mb: u64,
    #[serde(default = "default_autosave_interval_ms")]
    pub state_autosave_interval_ms: u64,
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_sessions: default_max_parallel(),
            session_timeout_seconds: default_timeout_secs(),
            auto_retry: false,
            retry_count: default_retry_count(),
            auto_cleanup_on_success: false,
            worker_command: None,
            workspace_dir: None,
            session_memory_budget_mb: default_memory_budget_mb(),
            state_autosave_interval_ms: default_autosave_interval_ms(),
            output_buffer_bytes: default_output_buffer_bytes(),
        }
    }
}

impl Config {
    pub fn cascade_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cascade"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cascade_dir()?.join("cascade.toml"))
    }

    pub fn state_path() -> Result<PathBuf> {
        Ok(Self::cascade_dir()?.join("state.json"))
    }

    pub fn session_logs_dir() -> Result<PathBuf> {
        Ok(Self::cascade_dir()?.join("logs"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cascade_dir()?.join("workspaces")),
        }
    }

    pub fn effective_worker_command(&self) -> &str {
        self.worker_command.as_deref().unwrap_or("claude")
    }

    /// Configured parallelism, clamped to 1..=HARD_SESSION_CAP.
    pub fn effective_max_parallel(&self) -> usize {
        self.max_parallel_sessions.clamp(1, HARD_SESSION_CAP)
    }

    pub fn session_timeout(&self) -> Option<std::time::Duration> {
        if self.session_timeout_seconds == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.session_timeout_seconds))
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: max_parallel={} timeout={}s auto_retry={}",
            config.max_parallel_sessions,
            config.session_timeout_seconds,
            config.auto_retry
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::cascade_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::cascade_dir()?;
        let workspaces = self.workspaces_dir()?;
        let logs = Self::session_logs_dir()?;
        for p in [&dir, &workspaces, &logs] {
            if !p.exists() {
                clog_debug!("Creating directory: {}", p.display());
                fs::create_dir_all(p)?;
            }
        }
        Ok(())
    }

    /// Resolve the worker executable on PATH.
    pub fn resolve_worker(&self) -> Result<PathBuf> {
        let cmd = self.effective_worker_command();
        // The configured command may carry arguments; only the first word
        // needs to resolve.
        let bin = cmd.split_whitespace().next().unwrap_or(cmd);
        which::which(bin).map_err(|_| Error::WorkerNotAvailable(bin.to_string()))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_parallel_sessions, 4);
        assert_eq!(config.session_timeout_seconds, 1800);
        assert!(!config.auto_retry);
        assert_eq!(config.retry_count, 1);
        assert!(!config.auto_cleanup_on_success);
        assert_eq!(config.effective_worker_command(), "claude");
    }

    #[test]
    fn test_max_parallel_clamped_to_hard_cap() {
        let config = Config {
            max_parallel_sessions: 64,
            ..Config::default()
        };
        assert_eq!(config.effective_max_parallel(), HARD_SESSION_CAP);

        let config = Config {
            max_parallel_sessions: 0,
            ..Config::default()
        };
        assert_eq!(config.effective_max_parallel(), 1);
    }

    #[test]
    fn test_session_timeout_zero_disables() {
        let config = Config {
            session_timeout_seconds: 0,
            ..Config::default()
        };
        assert!(config.session_timeout().is_none());

        let config = Config {
            session_timeout_seconds: 30,
            ..Config::default()
        };
        assert_eq!(
            config.session_timeout(),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().contains('~'));

        let absolute = expand_tilde("/absolute/path");
        assert_eq!(absolute, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config {
            max_parallel_sessions: 2,
            session_timeout_seconds: 600,
            auto_retry: true,
            retry_count: 3,
            auto_cleanup_on_success: true,
            worker_command: Some("claude --dangerously-skip-permissions".to_string()),
            workspace_dir: Some("~/workspaces".to_string()),
            ..Config::default()
        };
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.max_parallel_sessions, 2);
        assert_eq!(parsed.retry_count, 3);
        assert!(parsed.auto_retry);
        assert!(parsed.auto_cleanup_on_success);
        assert_eq!(parsed.workspace_dir, Some("~/workspaces".to_string()));
    }

    #[test]
    fn test_partial_toml_uses_field_defaults() {
        let parsed: Config = toml::from_str("max_parallel_sessions = 6\n").unwrap();
        assert_eq!(parsed.max_parallel_sessions, 6);
        assert_eq!(parsed.session_timeout_seconds, 1800);
        assert_eq!(parsed.output_buffer_bytes, 256 * 1024);
    }
}
