use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log::LogLevel;
use crate::orchestration::FailurePolicy;
use crate::{slog_debug, Error, Result};

/// Per-tool overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Replaces the program name the adapter builds (e.g. an absolute path).
    pub binary: Option<String>,
    pub timeout_secs: Option<u64>,
    /// Disabled tools are skipped instead of run.
    pub enabled: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: None,
            timeout_secs: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub default_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub kill_grace_millis: u64,
    pub failure_policy: FailurePolicy,
    pub log_level: String,
    pub log_file: Option<String>,
    pub tools: BTreeMap<String, ToolSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_timeout_secs: 300,
            task_timeout_secs: 600,
            kill_grace_millis: 2000,
            failure_policy: FailurePolicy::default(),
            log_level: "info".to_string(),
            log_file: None,
            tools: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn scanflow_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".scanflow"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::scanflow_dir()?.join("scanflow.toml"))
    }

    /// Load `~/.scanflow/scanflow.toml`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            slog_debug!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        slog_debug!("EngineConfig::load_from path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        slog_debug!(
            "Config loaded: max_concurrent={}, task_timeout_secs={}, policy={:?}",
            config.max_concurrent,
            config.task_timeout_secs,
            config.failure_policy
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::scanflow_dir()?;
        if !dir.exists() {
            slog_debug!("Creating scanflow directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        slog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".to_string()));
        }
        if self.default_timeout_secs == 0 || self.task_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        for (name, tool) in &self.tools {
            if tool.timeout_secs == Some(0) {
                return Err(Error::Config(format!("tools.{}.timeout_secs must be positive", name)));
            }
        }
        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> Result<LogLevel> {
        self.log_level.parse().map_err(Error::Config)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        match &self.log_file {
            Some(file) => Some(expand_tilde(file)),
            None => crate::log::default_log_path(),
        }
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
