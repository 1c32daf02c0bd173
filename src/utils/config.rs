// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate, later sources win:
//!
//! 1. Built-in defaults
//! 2. `offload.{toml,yaml,json}` in the working directory, or an explicit file
//! 3. Environment variables: `OFFLOAD_<SECTION>__<KEY>`, for example
//!    `OFFLOAD_POOL__MAX_WORKERS=8` or `OFFLOAD_LOGGING__FORMAT=json`

use crate::runtime::limits::PoolLimits;
use crate::runtime::unit_spawner::SpawnConfig;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level when no filter variable is set
    pub level: String,

    pub format: LogFormat,

    /// Forwarded to units with every run
    pub unit_logging: bool,

    /// Surface parser progress text from units
    pub unit_debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            unit_logging: false,
            unit_debug: false,
        }
    }
}

/// Runtime section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deep-copy job input instead of moving the buffer handle
    pub force_copy: bool,

    pub thread_name_prefix: String,

    /// Unit thread stack size in bytes
    pub unit_stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            force_copy: false,
            thread_name_prefix: "offload-unit".to_string(),
            unit_stack_size: None,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub pool: PoolLimits,
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Load from `offload.*` (optional) and the environment
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from an explicit file and the environment
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("offload").required(false),
        };

        let config: EngineConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("OFFLOAD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().map_err(EngineError::InvalidPoolConfig)?;

        if self.runtime.thread_name_prefix.is_empty() {
            return Err(EngineError::InvalidPoolConfig(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }
        if self.runtime.unit_stack_size == Some(0) {
            return Err(EngineError::InvalidPoolConfig(
                "unit_stack_size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Spawner settings for unit threads
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            thread_name_prefix: self.runtime.thread_name_prefix.clone(),
            stack_size: self.runtime.unit_stack_size,
        }
    }
}
