//! Engine and service configuration
//!
//! Defaults reproduce the classic behaviour: a report every 10s, long-lived
//! processes rescanned every 10s, stale records swept every 5 minutes.
//!
//! # Example TOML
//! ```toml
//! [engine]
//! history = true
//! max_walk_depth = 512
//!
//! [service]
//! report_interval = "30s"
//! clear_on_report = true
//! rescan_interval = "10s"
//! sweep_interval = "5m"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Shortest non-zero timer period accepted
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Errors for configuration validation
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_walk_depth must be >= 1, got {0}")]
    InvalidWalkDepth(usize),

    #[error("{name} must be 0 (disabled) or at least 1ms, got {value:?}")]
    TimerTooShort { name: &'static str, value: Duration },
}

/// Accounting engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Track the execution-time histogram of exited processes
    pub history: bool,

    /// Maximum ancestors visited per event
    ///
    /// Real process trees are at most a few hundred levels deep; the limit
    /// only matters for corrupted (cyclic) parent chains.
    pub max_walk_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history: false,
            max_walk_depth: 1024,
        }
    }
}

/// Timer settings; a zero duration disables the timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Period between automatic reports
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,

    /// Start a new sample window after every periodic report
    pub clear_on_report: bool,

    /// Period between long-lived process rescans
    #[serde(with = "humantime_serde")]
    pub rescan_interval: Duration,

    /// Period between stale record sweeps
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(10),
            clear_on_report: false,
            rescan_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
}

impl Config {
    /// Load a TOML configuration file; missing keys take their defaults
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.engine.max_walk_depth == 0 {
            return Err(ConfigError::InvalidWalkDepth(0));
        }
        let timers = [
            ("report_interval", self.service.report_interval),
            ("rescan_interval", self.service.rescan_interval),
            ("sweep_interval", self.service.sweep_interval),
        ];
        for (name, value) in timers {
            if !value.is_zero() && value < MIN_TIMER_PERIOD {
                return Err(ConfigError::TimerTooShort { name, value });
            }
        }
        Ok(())
    }
}
