//! Runtime configuration, resolved from constructor arguments with
//! environment-variable fallbacks — the same `std::env::var(..).unwrap_or_else(..)`
//! idiom `Config::new` uses in the sequential-runner config, generalized
//! with builder-style `with_x` methods in the style of `ExecutorConfig::from_config`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

const DEFAULT_MAX_PARALLEL: usize = 3;
const DEFAULT_BRANCH_PREFIX: &str = "claudio";
const DEFAULT_COMPLETION_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_MONITOR_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 3600;

/// Resolved runtime settings for one session's orchestration.
///
/// `max_parallel == 0` means unlimited fan-out (see SPEC_FULL.md §13); any
/// positive value is a hard cap on concurrently running tasks.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub project_dir: PathBuf,
    pub branch_prefix: String,
    pub max_parallel: usize,
    pub synthesis_enabled: bool,
    pub phase_timeout: Duration,
    pub completion_poll_interval: Duration,
    pub monitor_tick_interval: Duration,
}

impl RuntimeConfig {
    /// Resolves a `RuntimeConfig` rooted at `project_dir`, applying
    /// environment-variable fallbacks for anything not overridden by a
    /// builder method before this is called.
    pub fn new(project_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let project_dir = project_dir.as_ref();
        let canonical = project_dir
            .canonicalize()
            .map_err(|source| ConfigError::ProjectDir { path: project_dir.to_path_buf(), source })?;

        let max_parallel = std::env::var("CLAUDIO_MAX_PARALLEL")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_MAX_PARALLEL as i64);
        if max_parallel < 0 {
            return Err(ConfigError::NegativeMaxParallel(max_parallel));
        }

        let branch_prefix = std::env::var("CLAUDIO_BRANCH_PREFIX")
            .unwrap_or_else(|_| DEFAULT_BRANCH_PREFIX.to_string());

        let synthesis_enabled = std::env::var("CLAUDIO_SYNTHESIS_ENABLED")
            .map(|v| v != "false")
            .unwrap_or(true);

        let phase_timeout_secs = std::env::var("CLAUDIO_PHASE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_PHASE_TIMEOUT_SECS);

        let completion_poll_ms = std::env::var("CLAUDIO_COMPLETION_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_COMPLETION_POLL_INTERVAL_MS);

        let monitor_tick_ms = std::env::var("CLAUDIO_MONITOR_TICK_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MONITOR_TICK_INTERVAL_MS);

        Ok(Self {
            project_dir: canonical,
            branch_prefix,
            max_parallel: max_parallel as usize,
            synthesis_enabled,
            phase_timeout: Duration::from_secs(phase_timeout_secs),
            completion_poll_interval: Duration::from_millis(completion_poll_ms),
            monitor_tick_interval: Duration::from_millis(monitor_tick_ms),
        })
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn with_synthesis_enabled(mut self, enabled: bool) -> Self {
        self.synthesis_enabled = enabled;
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    /// `true` when `max_parallel == 0`, i.e. no fan-out cap is applied.
    pub fn is_unlimited_parallel(&self) -> bool {
        self.max_parallel == 0
    }

    /// The `.claudio/` directory under the project root, where the
    /// checkpoint and audit trail live.
    pub fn claudio_dir(&self) -> PathBuf {
        self.project_dir.join(".claudio")
    }

    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        let dir = self.claudio_dir();
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::ProjectDir { path: dir, source })
    }
}
