// src/utils/errors.rs
//! Error types for the offload engine
//!
//! Structural misconfiguration surfaces as an `EngineError` at the offending
//! call. Recoverable conditions (full queue, duplicate run, unknown protocol
//! tag) are logged by the caller and never reach this type.

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Supervisor {0} has no callbacks; call set_callbacks() before run()")]
    MissingCallbacks(usize),

    #[error("Invalid loader factory: {0}")]
    InvalidLoaderFactory(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidPoolConfig(String),

    #[error("Unknown parser module '{0}'")]
    UnknownModule(String),

    #[error("Failed to spawn execution unit: {0}")]
    UnitSpawnFailed(String),

    #[error("Execution unit {0} is not reachable")]
    UnitUnreachable(usize),

    #[error("Failed to fetch '{url}': {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Parser error: {0}")]
    Parse(String),

    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
