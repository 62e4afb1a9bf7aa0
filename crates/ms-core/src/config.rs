//! Configuration system for the midsched scheduler

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MidschedError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub registers: RegisterConfig,
    pub debug: DebugConfig,
}

/// Bundle scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ready instructions further than this from the most recently readied
    /// one are not considered, bounding live-range growth
    pub lookback_window: usize,
    /// Spill/fill rounds before register allocation is abandoned
    pub max_spill_iterations: u32,
}

/// Register file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterConfig {
    /// Work registers available to the pressure allocator
    pub work_registers: u32,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub print_bundles: bool,
    pub print_program: bool,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookback_window: 6,
            max_spill_iterations: 1000,
        }
    }
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self { work_registers: 16 }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            print_bundles: true,
            print_program: false,
        }
    }
}

impl Config {
    /// Load configuration from the user config directory, or create a default one
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&content).map_err(|e| MidschedError::Config(e.to_string()))
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| MidschedError::Config(e.to_string()))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("midsched")
            .join("config.toml")
    }
}
