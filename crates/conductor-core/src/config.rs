//! Configuration management for Conductor

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::approval::DEFAULT_ESCALATION_TIMEOUT;
use crate::error::{Error, Result};
use crate::policy::ConfirmationPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Confirmation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Policy new sessions start with (auto_approve_all, confirm_all, risky, confirm_above:<risk>)
    pub default_policy: String,
    /// Seconds to wait for a decision before deferring
    pub escalation_timeout_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            default_policy: ConfirmationPolicy::ConfirmAll.to_string(),
            escalation_timeout_secs: DEFAULT_ESCALATION_TIMEOUT.as_secs(),
        }
    }
}

/// Execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Seconds a cancel waits for a cooperative stop before aborting the worker
    pub cancel_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { cancel_timeout_secs: 10 }
    }
}

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Runtime settings the coordinator is started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub policy: ConfirmationPolicy,
    pub escalation_timeout: Duration,
    pub cancel_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            policy: ConfirmationPolicy::default(),
            escalation_timeout: DEFAULT_ESCALATION_TIMEOUT,
            cancel_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = config
            .confirmation
            .default_policy
            .parse()
            .map_err(Error::Config)?;

        Ok(Self {
            policy,
            escalation_timeout: Duration::from_secs(config.confirmation.escalation_timeout_secs),
            cancel_timeout: Duration::from_secs(config.execution.cancel_timeout_secs),
        })
    }

    pub fn with_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("conductor").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn settings(&self) -> Result<CoordinatorSettings> {
        CoordinatorSettings::from_config(&self.config)
    }
}
