// src/runtime/mod.rs
//! Execution unit runtime
//!
//! This module provides the offloading machinery, including:
//!
//! - **Worker Pool**: Bounded instruction queue dispatched across N slots
//! - **Supervisor**: Lifecycle and protocol handling for one execution unit
//! - **Unit Spawner**: Dedicated named threads hosting the units
//! - **Runner**: In-unit handling of `run` commands
//! - **Packager**: Prebuilt parser modules and unit manifests
//! - **Protocol**: `cmd`-tagged messages between supervisor and unit
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  PoolDirector (1 thread)             │
//! │   InstructionQueue ──drive()──▶ Slot 0 .. Slot N-1   │
//! │                                 Loader               │
//! │                                 UnitSupervisor       │
//! └───────────────┬──────────────────────▲───────────────┘
//!        run/exit │ crossbeam            │ tokio mpsc
//!                 ▼                      │ UnitEnvelope
//! ┌──────────────────────────────────────────────────────┐
//! │  unit thread: build image ─▶ ready ─▶ Runner loop    │
//! │               (Parser, fetched libraries)            │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod fetch;
pub mod instruction_queue;
pub mod limits;
pub mod loader;
pub mod packager;
pub mod parser;
pub mod protocol;
pub mod runner;
pub mod supervisor;
pub mod unit_spawner;
pub mod worker_pool;

// Re-export commonly used types
pub use fetch::{FileFetcher, LibrarySet, ResourceFetcher, StaticFetcher};
pub use instruction_queue::{InstructionQueue, QueueStats};
pub use limits::{PoolLimits, MAX_QUEUE_SIZE, MAX_WORKERS};
pub use loader::{parser_loader_factory, ParserLoader};
pub use packager::{ConfigValue, Instancing, ModuleRegistry, ParserModule, UnitImage};
pub use parser::{setting_value, ParseSink, Parser};
pub use protocol::{
    Completion, JobId, JobOutcome, LoggingFlags, Payload, RunRequest, SettingsBag, UnitCommand,
    UnitMessage,
};
pub use runner::{ParserRunner, Runner, RunnerFactory, UnitOutbox};
pub use supervisor::{
    Job, MessageDisposition, RunDisposition, SupervisorState, SupervisorStats, UnitSupervisor,
};
pub use unit_spawner::{SpawnConfig, UnitSpawner};
pub use worker_pool::{
    CallbackBag, Instruction, Loader, LoaderFactory, PoolDirector, PoolOptions, PoolStats,
    ProgressEvent,
};
