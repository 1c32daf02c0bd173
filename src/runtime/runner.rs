// src/runtime/runner.rs
//! In-unit protocol handling
//!
//! This is what runs on an execution unit's thread: construct the unit image,
//! announce readiness, then serve `run` commands one at a time until `exit`
//! or until the supervisor drops its command channel.

use crate::runtime::fetch::ResourceFetcher;
use crate::runtime::packager::{build_image, Instancing, ParserModule, UnitBlueprint, UnitImage};
use crate::runtime::parser::{ParseSink, Parser};
use crate::runtime::protocol::{RunRequest, SettingsBag, UnitCommand, UnitEnvelope, UnitMessage};
use crate::utils::errors::Result;
use crossbeam_channel::Receiver;
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, trace, warn};

/// Name of the default runner
pub const DEFAULT_RUNNER_NAME: &str = "ParserRunner";

/// Constructor for runner instances, invoked once per unit
pub type RunnerFactory = Arc<dyn Fn() -> Box<dyn Runner> + Send + Sync>;

/// Handles `run` commands inside a unit.
///
/// Implementations must post exactly one `complete` or `error` per request.
pub trait Runner: Send {
    fn run(&mut self, request: RunRequest, image: &UnitImage, outbox: &UnitOutbox);
}

/// Sending half of a unit's message channel
#[derive(Debug, Clone)]
pub struct UnitOutbox {
    unit_id: usize,
    generation: u64,
    tx: UnboundedSender<UnitEnvelope>,
}

impl UnitOutbox {
    pub(crate) fn new(unit_id: usize, generation: u64, tx: UnboundedSender<UnitEnvelope>) -> Self {
        Self {
            unit_id,
            generation,
            tx,
        }
    }

    pub fn unit_id(&self) -> usize {
        self.unit_id
    }

    /// Post a message to the supervisor.
    ///
    /// Returns false once the supervisor side is gone.
    pub fn post(&self, message: UnitMessage) -> bool {
        trace!(unit_id = self.unit_id, cmd = message.cmd(), "Unit posting message");
        self.tx
            .send(UnitEnvelope {
                unit_id: self.unit_id,
                generation: self.generation,
                message,
            })
            .is_ok()
    }

    /// Post a message given in its JSON line form
    pub fn post_line(&self, line: &str) -> bool {
        match UnitMessage::from_line(line) {
            Ok(message) => self.post(message),
            Err(e) => {
                warn!(unit_id = self.unit_id, error = %e, "Undecodable unit message");
                self.post(UnitMessage::Unknown)
            }
        }
    }
}

struct OutboxSink<'a> {
    outbox: &'a UnitOutbox,
    debug: bool,
}

impl ParseSink for OutboxSink<'_> {
    fn intermediate(&mut self, message: UnitMessage) {
        self.outbox.post(message);
    }

    fn progress(&mut self, text: &str) {
        if self.debug {
            debug!(unit_id = self.outbox.unit_id(), "{}", text);
        }
    }
}

/// Default runner: configure the bound parser and parse the input
#[derive(Default)]
pub struct ParserRunner {
    shared: Option<Box<dyn Parser>>,
}

impl ParserRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for the default runner
    pub fn factory() -> RunnerFactory {
        Arc::new(|| Box::new(ParserRunner::new()) as Box<dyn Runner>)
    }

    fn execute(
        &mut self,
        request: RunRequest,
        image: &UnitImage,
        outbox: &UnitOutbox,
    ) -> Result<Value> {
        let mut fresh: Box<dyn Parser>;
        let parser: &mut dyn Parser = match image.module.instancing() {
            Instancing::Shared => self
                .shared
                .get_or_insert_with(|| image.module.instantiate())
                .as_mut(),
            Instancing::PerRun => {
                fresh = image.module.instantiate();
                fresh.as_mut()
            }
        };

        parser.set_logging(request.logging.enabled, request.logging.debug);
        apply_settings(parser, &image.module, &request.params)?;
        apply_settings(parser, &image.module, &request.materials)?;

        let mut sink = OutboxSink {
            outbox,
            debug: request.logging.enabled && request.logging.debug,
        };
        parser.parse(
            &request.data.input,
            request.data.options.as_ref(),
            &mut sink,
        )
    }
}

impl Runner for ParserRunner {
    fn run(&mut self, request: RunRequest, image: &UnitImage, outbox: &UnitOutbox) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(request, image, outbox)
        }));

        let message = match result {
            Ok(Ok(data)) => UnitMessage::Complete { data: Some(data) },
            Ok(Err(e)) => UnitMessage::Error { msg: e.to_string() },
            Err(panic) => {
                // A shared parser may be left half-updated
                self.shared = None;
                UnitMessage::Error {
                    msg: format!("parser panicked: {}", panic_message(panic.as_ref())),
                }
            }
        };

        outbox.post(message);
    }
}

fn apply_settings(parser: &mut dyn Parser, module: &ParserModule, bag: &SettingsBag) -> Result<()> {
    for (key, value) in bag {
        if !module.accepts_setting(key) {
            trace!(module = module.name(), key = %key, "Setting excluded by module");
            continue;
        }
        if !parser.apply_setting(key, value)? {
            trace!(module = module.name(), key = %key, "Parser has no such setting, ignoring");
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Load a request's input from its location, if it names one
fn fetch_input(request: &mut RunRequest, fetcher: &dyn ResourceFetcher) -> Result<()> {
    if let Some(location) = request.data.location.take() {
        request.data.input = fetcher.load(&location)?;
        trace!(location = %location, bytes = request.data.input.len(), "Input fetched");
    }
    Ok(())
}

/// Unit thread entry point
pub(crate) fn unit_main(
    blueprint: UnitBlueprint,
    runner_factory: RunnerFactory,
    fetcher: Arc<dyn ResourceFetcher>,
    commands: Receiver<UnitCommand>,
    outbox: UnitOutbox,
) {
    let unit_id = outbox.unit_id();

    let image = match build_image(&blueprint, fetcher.as_ref()) {
        Ok(image) => image,
        Err(e) => {
            error!(unit_id, error = %e, "Unit construction failed");
            outbox.post(UnitMessage::BuildFailed { msg: e.to_string() });
            return;
        }
    };

    debug!(
        unit_id,
        module = image.module.name(),
        runner = %image.runner_name,
        manifest_bytes = image.manifest.len(),
        "Unit constructed"
    );
    outbox.post(UnitMessage::Ready);

    let mut runner = runner_factory();

    while let Ok(command) = commands.recv() {
        match command {
            UnitCommand::Run(mut request) => {
                if let Err(e) = fetch_input(&mut request, fetcher.as_ref()) {
                    warn!(unit_id, error = %e, "Input fetch failed");
                    outbox.post(UnitMessage::Error { msg: e.to_string() });
                    continue;
                }
                runner.run(request, &image, &outbox)
            }
            UnitCommand::Exit => break,
        }
    }

    debug!(unit_id, "Unit run loop finished");
}
