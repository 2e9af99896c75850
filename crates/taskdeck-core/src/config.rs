//! Taskdeck configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskdeckError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskdeckConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Schedule entries declared in config rather than in the database.
    #[serde(default)]
    pub static_entries: Vec<StaticEntryConfig>,
}

impl Default for TaskdeckConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            commands: CommandConfig::default(),
            notify: NotifyConfig::default(),
            static_entries: Vec::new(),
        }
    }
}

impl TaskdeckConfig {
    /// Load config from the default path (~/.taskdeck/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskdeckError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskdeckError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskdeckError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.tick_interval_secs == 0 {
            return Err(TaskdeckError::Config("scheduler.tick_interval_secs must be > 0".into()));
        }
        if s.worker_count == 0 {
            return Err(TaskdeckError::Config("scheduler.worker_count must be > 0".into()));
        }
        if s.queue_capacity == 0 {
            return Err(TaskdeckError::Config("scheduler.queue_capacity must be > 0".into()));
        }
        if s.default_timeout_secs == 0 {
            return Err(TaskdeckError::Config("scheduler.default_timeout_secs must be > 0".into()));
        }
        if s.max_consecutive_failures == 0 {
            return Err(TaskdeckError::Config(
                "scheduler.max_consecutive_failures must be > 0".into(),
            ));
        }
        if s.default_timezone.trim().is_empty() {
            return Err(TaskdeckError::Config("scheduler.default_timezone is empty".into()));
        }
        for entry in &self.static_entries {
            if entry.name.trim().is_empty() || entry.command.trim().is_empty() {
                return Err(TaskdeckError::Config(
                    "static entries need a name and a command".into(),
                ));
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Taskdeck home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskdeck")
    }
}

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

fn default_db_path() -> String { "~/.taskdeck/taskdeck.db".into() }

/// Which store backs `prevent_overlap` leases.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapBackend {
    /// Single-process guard.
    Memory,
    /// Lease rows in the shared database; works across processes.
    Database,
}

/// Scheduler and executor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// How often the event table is rebuilt from the registry (0 = only at start).
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval_secs: u64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Timeout for tasks without `max_runtime_seconds`.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_overlap_backend")]
    pub overlap_backend: OverlapBackend,
    /// Added on top of the task timeout when computing a lease TTL.
    #[serde(default = "default_lease_grace")]
    pub lease_grace_secs: u64,
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
    #[serde(default = "default_run_now_wait")]
    pub run_now_wait_secs: u64,
    #[serde(default = "default_log_retention")]
    pub log_retention_days: u32,
}

fn default_tick_interval() -> u64 { 60 }
fn default_rebuild_interval() -> u64 { 300 }
fn default_worker_count() -> usize { 4 }
fn default_queue_capacity() -> usize { 256 }
fn default_timeout() -> u64 { 3600 }
fn default_timezone() -> String { "UTC".into() }
fn default_max_failures() -> u32 { 3 }
fn default_overlap_backend() -> OverlapBackend { OverlapBackend::Database }
fn default_lease_grace() -> u64 { 60 }
fn default_output_limit() -> usize { 64 * 1024 }
fn default_run_now_wait() -> u64 { 60 }
fn default_log_retention() -> u32 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            rebuild_interval_secs: default_rebuild_interval(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            default_timeout_secs: default_timeout(),
            default_timezone: default_timezone(),
            max_consecutive_failures: default_max_failures(),
            overlap_backend: default_overlap_backend(),
            lease_grace_secs: default_lease_grace(),
            output_limit_bytes: default_output_limit(),
            run_now_wait_secs: default_run_now_wait(),
            log_retention_days: default_log_retention(),
        }
    }
}

/// How Command tasks are launched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Argv prepended to every command line, e.g. `["/opt/app/bin/console"]`.
    #[serde(default)]
    pub prefix: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

/// Where health alerts go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// A schedule entry declared in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticEntryConfig {
    pub name: String,
    pub command: String,
    pub expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}
