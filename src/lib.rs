// src/lib.rs
//! Offload Engine Library
//!
//! Moves expensive decode and parse work (mesh and point-cloud formats,
//! image decoding) onto isolated execution units so the controlling thread
//! stays responsive, and batches many such jobs across a bounded pool.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **runtime**: Packaging, unit supervision, pool scheduling
//! - **observability**: Tracing subscriber setup and metric names
//! - **utils**: Configuration and error types

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::supervisor::{Job, UnitSupervisor};
pub use runtime::worker_pool::{CallbackBag, Instruction, PoolDirector, PoolOptions};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
