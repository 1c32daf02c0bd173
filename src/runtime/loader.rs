// src/runtime/loader.rs
//! Default loader: run an instruction through a registered parser module

use crate::runtime::fetch::LibrarySet;
use crate::runtime::packager::ModuleRegistry;
use crate::runtime::protocol::{Completion, UnitMessage};
use crate::runtime::supervisor::{
    CompleteCallback, IntermediateCallback, Job, RunDisposition, UnitSupervisor,
};
use crate::runtime::worker_pool::{CallbackBag, Instruction, Loader, LoaderFactory, ProgressEvent};
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tracing::debug;

/// Loader binding every instruction to one parser module.
///
/// The input comes from the instruction itself, or, when it carries none,
/// from its first resource location. The unit loads that location through
/// its own fetcher, off the orchestrating thread.
pub struct ParserLoader {
    instance_no: usize,
    callbacks: CallbackBag,
    registry: Arc<ModuleRegistry>,
    parser_name: String,
    libraries: Option<LibrarySet>,
}

impl ParserLoader {
    pub fn new(registry: Arc<ModuleRegistry>, parser_name: impl Into<String>) -> Self {
        Self {
            instance_no: 0,
            callbacks: CallbackBag::default(),
            registry,
            parser_name: parser_name.into(),
            libraries: None,
        }
    }

    /// Libraries prepended to every unit this loader builds
    pub fn with_libraries(mut self, libraries: LibrarySet) -> Self {
        self.libraries = Some(libraries);
        self
    }

    pub fn parser_name(&self) -> &str {
        &self.parser_name
    }

    fn job_for(&self, instruction: &Instruction) -> Result<Job> {
        if let Some(input) = &instruction.input {
            return Ok(Job::new(input.clone()));
        }

        match instruction.resources.first() {
            Some(location) => Ok(Job::from_location(location.clone())),
            None => Err(EngineError::Loader(format!(
                "instruction '{}' has no input",
                instruction.label
            ))),
        }
    }
}

impl Loader for ParserLoader {
    fn set_instance_no(&mut self, instance_no: usize) {
        self.instance_no = instance_no;
    }

    fn instance_no(&self) -> usize {
        self.instance_no
    }

    fn callbacks(&self) -> &CallbackBag {
        &self.callbacks
    }

    fn set_callbacks(&mut self, callbacks: CallbackBag) {
        self.callbacks = callbacks;
    }

    fn run(&mut self, instruction: Instruction, supervisor: &mut UnitSupervisor) -> Result<()> {
        let job = self.job_for(&instruction)?;

        let on_intermediate: IntermediateCallback = match &self.callbacks.on_intermediate {
            Some(f) => Arc::clone(f),
            None => Arc::new(|_: &UnitMessage| {}),
        };
        let on_complete: CompleteCallback = match &self.callbacks.on_complete {
            Some(f) => Arc::clone(f),
            None => Arc::new(|_: &Completion| {}),
        };
        supervisor.set_callbacks(on_intermediate, on_complete);

        supervisor.ensure_ready(
            || self.registry.resolve(&self.parser_name),
            &self.parser_name,
            self.libraries.as_ref(),
        )?;

        self.callbacks.progress(&ProgressEvent {
            slot: self.instance_no,
            text: format!("Parsing {} with {}", instruction.label, self.parser_name),
            terminal: false,
        });

        let mut job = job
            .with_params(instruction.params)
            .with_materials(instruction.materials);
        job.options = instruction.options;
        let job_id = job.id;

        match supervisor.run(job)? {
            RunDisposition::Rejected => Err(EngineError::Loader(format!(
                "slot {} already has a job in flight",
                self.instance_no
            ))),
            disposition => {
                debug!(slot = self.instance_no, job_id = %job_id, ?disposition, "Job accepted");
                Ok(())
            }
        }
    }
}

/// Factory producing a [`ParserLoader`] per slot
pub fn parser_loader_factory(
    registry: Arc<ModuleRegistry>,
    parser_name: impl Into<String>,
    libraries: Option<LibrarySet>,
) -> LoaderFactory {
    let parser_name = parser_name.into();
    Box::new(move |instance_no| {
        let mut loader = ParserLoader::new(Arc::clone(&registry), parser_name.clone());
        if let Some(libraries) = &libraries {
            loader = loader.with_libraries(libraries.clone());
        }
        loader.set_instance_no(instance_no);
        Ok(Box::new(loader) as Box<dyn Loader>)
    })
}
