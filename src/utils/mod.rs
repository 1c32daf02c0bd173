// src/utils/mod.rs
//! Configuration and error types shared across the engine

pub mod config;
pub mod errors;

pub use self::config::{EngineConfig, LogFormat, LoggingConfig, RuntimeConfig};
pub use self::errors::{EngineError, Result};
