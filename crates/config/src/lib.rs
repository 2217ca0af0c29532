//! WARDEN: Runtime configuration
//!
//! Loads and saves the engine's tunables (step budgets, resource thresholds,
//! detector windows, edit resolution and background jobs) from
//! `~/.warden/config.json`. Every field carries a serde default so partial
//! files are accepted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir, sessions_dir, workspace_path};

/// Errors in configuration handling
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("CONFIG IO ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("CONFIG PARSE ERROR: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CONFIG NOT FOUND: {0}")]
    NotFound(PathBuf),

    #[error("INVALID CONFIG: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Run-loop tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Hard cap on provider round-trips per `Run`
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_consecutive_error_limit")]
    pub consecutive_error_limit: u32,
    #[serde(default = "default_max_no_progress_turns")]
    pub max_no_progress_turns: u32,
    /// Minimum interval between two auto-continuations of one session
    #[serde(default = "default_continuation_cooldown_ms")]
    pub continuation_cooldown_ms: u64,
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_steps: default_max_steps(),
            consecutive_error_limit: default_consecutive_error_limit(),
            max_no_progress_turns: default_max_no_progress_turns(),
            continuation_cooldown_ms: default_continuation_cooldown_ms(),
            provider_retries: default_provider_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RuntimeConfig {
    pub fn continuation_cooldown(&self) -> Duration {
        Duration::from_millis(self.continuation_cooldown_ms)
    }

    /// Exponential backoff for the given retry attempt (1-based), capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

fn default_workspace() -> String {
    "~/.warden/workspace".to_string()
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_steps() -> u32 {
    20
}

fn default_consecutive_error_limit() -> u32 {
    5
}

fn default_max_no_progress_turns() -> u32 {
    5
}

fn default_continuation_cooldown_ms() -> u64 {
    250
}

fn default_provider_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8000
}

/// Resource admission thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f32,
    #[serde(default = "default_mem_threshold")]
    pub mem_threshold: f32,
    #[serde(default = "default_disk_min_free_gb")]
    pub disk_min_free_gb: f64,
    /// Consecutive admissible samples required before resuming
    #[serde(default = "default_recovery_samples")]
    pub recovery_samples: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            cpu_threshold: default_cpu_threshold(),
            mem_threshold: default_mem_threshold(),
            disk_min_free_gb: default_disk_min_free_gb(),
            recovery_samples: default_recovery_samples(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn disk_min_free_bytes(&self) -> u64 {
        (self.disk_min_free_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    5
}

fn default_cpu_threshold() -> f32 {
    80.0
}

fn default_mem_threshold() -> f32 {
    85.0
}

fn default_disk_min_free_gb() -> f64 {
    5.0
}

fn default_recovery_samples() -> u32 {
    2
}

/// Loop and drift detector windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    #[serde(default = "default_loop_window")]
    pub loop_window: usize,
    #[serde(default = "default_loop_interval")]
    pub loop_interval: usize,
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
    #[serde(default = "default_drift_window")]
    pub drift_window: usize,
    #[serde(default = "default_drift_interval")]
    pub drift_interval: usize,
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// Matching failures (same target, same error) before a notice is queued
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Quiet period after which a file's failed-edit count starts over
    #[serde(default = "default_edit_circuit_reset_secs")]
    pub edit_circuit_reset_secs: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            loop_window: default_loop_window(),
            loop_interval: default_loop_interval(),
            loop_threshold: default_loop_threshold(),
            drift_window: default_drift_window(),
            drift_interval: default_drift_interval(),
            drift_threshold: default_drift_threshold(),
            failure_threshold: default_failure_threshold(),
            edit_circuit_reset_secs: default_edit_circuit_reset_secs(),
        }
    }
}

impl AnomalyConfig {
    pub fn edit_circuit_reset(&self) -> Duration {
        Duration::from_secs(self.edit_circuit_reset_secs)
    }
}

fn default_loop_window() -> usize {
    10
}

fn default_loop_interval() -> usize {
    5
}

fn default_loop_threshold() -> usize {
    3
}

fn default_drift_window() -> usize {
    20
}

fn default_drift_interval() -> usize {
    10
}

fn default_drift_threshold() -> f64 {
    0.85
}

fn default_failure_threshold() -> usize {
    3
}

fn default_edit_circuit_reset_secs() -> u64 {
    300
}

/// Self-healing edit resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Files at or above this size skip fuzzy matching
    #[serde(default = "default_max_fuzzy_bytes")]
    pub max_fuzzy_bytes: usize,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_fuzzy_bytes: default_max_fuzzy_bytes(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.90
}

fn default_max_fuzzy_bytes() -> usize {
    50 * 1024
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

/// Remote edit-assist endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoteAssistConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
}

/// Background job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Commands still running after this budget continue in the background
    #[serde(default = "default_inline_budget_secs")]
    pub inline_budget_secs: u64,
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_jobs: default_max_jobs(),
            retention_hours: default_retention_hours(),
            inline_budget_secs: default_inline_budget_secs(),
            shell: default_shell(),
        }
    }
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 60 * 60)
    }

    pub fn inline_budget(&self) -> Duration {
        Duration::from_secs(self.inline_budget_secs)
    }
}

fn default_max_jobs() -> usize {
    50
}

fn default_retention_hours() -> u64 {
    8
}

fn default_inline_budget_secs() -> u64 {
    60
}

fn default_shell() -> String {
    "sh".to_string()
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub edit: EditConfig,
    #[serde(default)]
    pub remote_assist: RemoteAssistConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Config {
    /// Load from the default location
    pub async fn load() -> Result<Self> {
        let path = config_path();
        Self::load_from(&path).await
    }

    /// Load from specific location; a missing file yields defaults
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("◆ NO CONFIG AT {:?}, USING DEFAULTS", path);
            return Ok(Config::default());
        }

        debug!("◆ LOADING CONFIG FROM {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to the default location
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("◆ WRITING CONFIG TO {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.runtime.max_steps == 0 {
            return Err(ConfigError::Invalid("runtime.max_steps must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.edit.confidence_threshold) {
            return Err(ConfigError::Invalid(
                "edit.confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if self.anomaly.loop_window == 0
            || self.anomaly.drift_window == 0
            || self.anomaly.failure_threshold == 0
        {
            return Err(ConfigError::Invalid(
                "anomaly windows must be non-empty".into(),
            ));
        }
        if self.jobs.max_jobs == 0 {
            return Err(ConfigError::Invalid("jobs.max_jobs must be > 0".into()));
        }
        if self.remote_assist.enabled && self.remote_assist.endpoint.is_empty() {
            return Err(ConfigError::Invalid(
                "remote_assist.endpoint required when enabled".into(),
            ));
        }
        Ok(())
    }

    /// Workspace root with `~` expanded
    pub fn workspace_path(&self) -> PathBuf {
        let path = &self.runtime.workspace;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        } else if path == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
        PathBuf::from(path)
    }

    /// Remote-assist endpoint, if enabled
    pub fn remote_endpoint(&self) -> Option<String> {
        if self.remote_assist.enabled && !self.remote_assist.endpoint.is_empty() {
            Some(self.remote_assist.endpoint.clone())
        } else {
            None
        }
    }
}

/// Write default config and create the workspace
pub async fn init() -> Result<Config> {
    let config_path = config_path();

    if config_path.exists() {
        warn!("◆ CONFIG ALREADY PRESENT AT {:?}", config_path);
    } else {
        let config = Config::default();
        config.save().await?;
        info!("◆ CONFIG WRITTEN TO {:?}", config_path);
    }

    let config = Config::load().await?;
    let workspace = config.workspace_path();
    tokio::fs::create_dir_all(&workspace).await?;
    tokio::fs::create_dir_all(sessions_dir()).await?;
    info!("◆ WORKSPACE READY AT {:?}", workspace);

    Ok(config)
}
