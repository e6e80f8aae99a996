use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::MonkeyResult;

pub const CONFIG_FILE_NAME: &str = "uimonkey.toml";
/// Points at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "UIMONKEY_CONFIG";
/// Set by the controller when it launches the target application.
pub const CONTROLLER_ADDR_ENV: &str = "UIMONKEY_CONTROLLER_ADDR";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `host:port` the agent connects to.
    #[serde(default = "default_address")]
    pub address: String,
    /// Size of a single socket read on the agent thread.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:7457".to_string()
}

fn default_read_chunk_bytes() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Minimum time the UI loop is pumped after a successful script.
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
    /// Upper bound of a single pump during the settle phase.
    #[serde(default = "default_settle_slice_ms")]
    pub settle_slice_ms: u64,
    /// How long the engine waits for the settle work before giving up on it.
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: default_settle_window_ms(),
            settle_slice_ms: default_settle_slice_ms(),
            settle_timeout_ms: default_settle_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimingConfig {
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn settle_slice(&self) -> Duration {
        Duration::from_millis(self.settle_slice_ms.max(1))
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_settle_window_ms() -> u64 {
    300
}

fn default_settle_slice_ms() -> u64 {
    10
}

fn default_settle_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(explicit);
        tracing::debug!(path = %candidate.display(), "config path taken from environment");
        return Some(candidate);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Some(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in working directory");
            return Some(candidate);
        }
    }

    let candidate = dirs::config_dir()?.join("uimonkey").join(CONFIG_FILE_NAME);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in user config dir");
        return Some(candidate);
    }
    None
}

/// Loads the agent config, falling back to defaults when no file exists.
/// The controller address can always be overridden from the environment.
pub fn load_config() -> MonkeyResult<AgentConfig> {
    let mut config = match resolve_config_path() {
        Some(path) => load_config_from(&path)?,
        None => {
            tracing::debug!("no config file found, using defaults");
            AgentConfig::default()
        }
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_config_from(path: &Path) -> MonkeyResult<AgentConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AgentConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), address = %config.controller.address, "config loaded");
    Ok(config)
}

fn apply_env_overrides(config: &mut AgentConfig) {
    if let Ok(addr) = std::env::var(CONTROLLER_ADDR_ENV) {
        let addr = addr.trim();
        if !addr.is_empty() {
            config.controller.address = addr.to_string();
        }
    }
}
