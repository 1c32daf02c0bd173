// src/runtime/unit_spawner.rs
//! Spawner for execution units
//!
//! A unit is a dedicated, named OS thread running [`unit_main`]. Threads
//! cannot be killed from outside; terminating a unit asks it to leave its run
//! loop and detaches the thread. Anything it posts afterwards carries an old
//! generation and is discarded by the supervisor.

use crate::runtime::fetch::{FileFetcher, ResourceFetcher};
use crate::runtime::packager::UnitBlueprint;
use crate::runtime::protocol::{UnitCommand, UnitEnvelope};
use crate::runtime::runner::{unit_main, RunnerFactory, UnitOutbox};
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Configuration for spawning units
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Thread names are `{prefix}-{unit_id}`
    pub thread_name_prefix: String,

    /// Stack size for unit threads, platform default when unset
    pub stack_size: Option<usize>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "offload-unit".to_string(),
            stack_size: None,
        }
    }
}

/// Creates unit threads
pub struct UnitSpawner {
    config: SpawnConfig,
    fetcher: Arc<dyn ResourceFetcher>,
}

impl UnitSpawner {
    pub fn new(config: SpawnConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self { config, fetcher }
    }

    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Spawn a unit thread for `blueprint`.
    ///
    /// Construction (library fetch, image assembly) happens on the new
    /// thread; the unit reports `ready` or `buildFailed` through `inbound`.
    pub fn spawn(
        &self,
        unit_id: usize,
        generation: u64,
        blueprint: UnitBlueprint,
        runner_factory: RunnerFactory,
        inbound: UnboundedSender<UnitEnvelope>,
    ) -> Result<UnitHandle> {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let outbox = UnitOutbox::new(unit_id, generation, inbound);
        let fetcher = Arc::clone(&self.fetcher);

        let name = format!("{}-{}", self.config.thread_name_prefix, unit_id);
        let mut builder = std::thread::Builder::new().name(name.clone());
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        debug!(unit_id, generation, thread = %name, "Spawning unit thread");

        let thread = builder
            .spawn(move || unit_main(blueprint, runner_factory, fetcher, commands_rx, outbox))
            .map_err(|e| {
                EngineError::UnitSpawnFailed(format!("Failed to spawn thread {}: {}", name, e))
            })?;

        Ok(UnitHandle {
            id: unit_id,
            generation,
            commands: commands_tx,
            thread: Some(thread),
            started_at: Instant::now(),
        })
    }
}

impl Default for UnitSpawner {
    fn default() -> Self {
        Self::new(SpawnConfig::default(), Arc::new(FileFetcher::new()))
    }
}

/// Handle to a running unit
#[derive(Debug)]
pub struct UnitHandle {
    pub id: usize,
    pub generation: u64,
    commands: Sender<UnitCommand>,
    thread: Option<JoinHandle<()>>,
    pub started_at: Instant,
}

impl UnitHandle {
    /// Send a command to the unit
    pub fn send(&self, command: UnitCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::UnitUnreachable(self.id))
    }

    /// Whether the unit thread has not finished yet
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Ask the unit to leave its run loop and detach the thread
    pub fn terminate(mut self) {
        trace!(unit_id = self.id, generation = self.generation, "Terminating unit");
        // A unit that already exited has dropped its receiver
        let _ = self.commands.send(UnitCommand::Exit);
        drop(self.thread.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fetch::{LibrarySet, StaticFetcher};
    use crate::runtime::packager::ParserModule;
    use crate::runtime::parser::{ParseSink, Parser};
    use crate::runtime::protocol::UnitMessage;
    use crate::runtime::runner::{ParserRunner, DEFAULT_RUNNER_NAME};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NullParser;

    impl Parser for NullParser {
        fn parse(
            &mut self,
            _input: &[u8],
            _options: Option<&Value>,
            _sink: &mut dyn ParseSink,
        ) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn blueprint(libraries: Option<LibrarySet>) -> UnitBlueprint {
        UnitBlueprint {
            module: ParserModule::new("NullParser", || Box::new(NullParser)),
            parser_name: "NullParser".into(),
            runner_name: DEFAULT_RUNNER_NAME.into(),
            libraries,
        }
    }

    #[tokio::test]
    async fn test_spawned_unit_reports_ready_and_exits() {
        let spawner = UnitSpawner::new(SpawnConfig::default(), Arc::new(StaticFetcher::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawner
            .spawn(3, 1, blueprint(None), ParserRunner::factory(), tx)
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.unit_id, 3);
        assert_eq!(envelope.generation, 1);
        assert_eq!(envelope.message, UnitMessage::Ready);

        handle.terminate();
    }

    #[tokio::test]
    async fn test_missing_library_reports_build_failed() {
        let spawner = UnitSpawner::new(SpawnConfig::default(), Arc::new(StaticFetcher::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawner
            .spawn(
                0,
                1,
                blueprint(Some(LibrarySet::new(["absent.js"]))),
                ParserRunner::factory(),
                tx,
            )
            .unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(envelope.message, UnitMessage::BuildFailed { .. }));

        // The unit left without entering its run loop
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.send(UnitCommand::Exit).is_err());
    }

    #[test]
    fn test_default_spawn_config() {
        let config = SpawnConfig::default();
        assert_eq!(config.thread_name_prefix, "offload-unit");
        assert!(config.stack_size.is_none());
    }
}
