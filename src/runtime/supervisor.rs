// src/runtime/supervisor.rs
//! Supervisor for a single execution unit
//!
//! Owns one unit from construction to teardown:
//! - Lazy, idempotent construction (`ensure_ready`)
//! - One job in flight at a time, buffered until the unit is ready
//! - Demultiplexing unit messages to the intermediate/complete callbacks
//! - Lazy termination once the unit has gone quiet
//! - Per-job deadline with forced unit replacement
//!
//! # States
//!
//! ```text
//! Uninitialized ──ensure_ready──▶ Building ──ready──▶ Idle ⇄ Busy
//!       ▲                            │                  │
//!       └──── buildFailed ───────────┘                  │
//!       └──── teardown / terminate requested / deadline ┘
//! ```
//!
//! A supervisor owned by a pool shares the pool's inbound channel and is
//! driven by the pool's event loop. A standalone supervisor owns its channel
//! and can be driven with [`UnitSupervisor::next_event`].

use crate::runtime::fetch::LibrarySet;
use crate::runtime::packager::{ParserModule, UnitBlueprint};
use crate::runtime::protocol::{
    Completion, JobData, JobId, JobOutcome, LoggingFlags, RunRequest, SettingsBag, UnitCommand,
    UnitEnvelope, UnitMessage,
};
use crate::runtime::runner::{ParserRunner, RunnerFactory, DEFAULT_RUNNER_NAME};
use crate::runtime::unit_spawner::{UnitHandle, UnitSpawner};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, trace, warn};

/// Receives intermediate results verbatim
pub type IntermediateCallback = Arc<dyn Fn(&UnitMessage) + Send + Sync>;

/// Receives the single completion of each job
pub type CompleteCallback = Arc<dyn Fn(&Completion) + Send + Sync>;

/// One unit of work for a supervisor
#[derive(Debug, Clone, Default)]
pub struct Job {
    pub id: JobId,
    pub params: SettingsBag,
    pub materials: SettingsBag,
    pub input: Bytes,
    /// Fetched by the unit into `input` before parsing
    pub location: Option<String>,
    pub options: Option<Value>,
}

impl Job {
    pub fn new(input: impl Into<Bytes>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Job whose input the unit loads through its fetcher
    pub fn from_location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: SettingsBag) -> Self {
        self.params = params;
        self
    }

    pub fn with_materials(mut self, materials: SettingsBag) -> Self {
        self.materials = materials;
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Observable supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No unit exists
    Uninitialized,
    /// Unit spawned, construction not confirmed yet
    Building,
    /// Unit ready, nothing in flight
    Idle,
    /// A job is accepted and not yet complete
    Busy,
}

/// What `run()` did with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    /// Sent to a ready unit
    Dispatched,
    /// Held until the unit reports ready
    Buffered,
    /// A job was already queued or in flight
    Rejected,
}

/// What handling one unit message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// From a unit this supervisor no longer owns
    Stale,
    /// Construction finished
    Ready,
    /// Forwarded to the intermediate callback
    Intermediate,
    /// The job in flight finished and its completion fired
    Completed(JobOutcome),
    /// Construction failed; any buffered job was dropped without completion
    BuildFailed,
    /// Logged and otherwise ignored
    Ignored,
}

/// Supervisor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub jobs_completed: u64,
    pub jobs_timed_out: u64,
    /// Units built after the first one
    pub restarts: u64,
}

#[derive(Debug)]
struct InFlight {
    job_id: JobId,
    started_at: Instant,
    deadline: Option<Instant>,
}

/// Supervisor managing a single execution unit
pub struct UnitSupervisor {
    id: usize,
    logging: LoggingFlags,
    force_copy: bool,
    callbacks: Option<(IntermediateCallback, CompleteCallback)>,
    user_runner: Option<(RunnerFactory, String)>,
    job_deadline: Option<Duration>,

    spawner: Arc<UnitSpawner>,
    unit: Option<UnitHandle>,
    generation: u64,
    ready: bool,

    queued: Option<RunRequest>,
    in_flight: Option<InFlight>,
    terminate_requested: bool,
    /// Runs completed by the current unit
    completed_runs: u64,
    stats: SupervisorStats,

    inbound_tx: UnboundedSender<UnitEnvelope>,
    inbound_rx: Option<UnboundedReceiver<UnitEnvelope>>,
}

impl UnitSupervisor {
    /// Standalone supervisor with the default spawner
    pub fn new(id: usize) -> Self {
        Self::with_spawner(id, Arc::new(UnitSpawner::default()))
    }

    /// Standalone supervisor owning its inbound channel
    pub fn with_spawner(id: usize, spawner: Arc<UnitSpawner>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut supervisor = Self::attached(id, spawner, tx);
        supervisor.inbound_rx = Some(rx);
        supervisor
    }

    /// Supervisor whose unit posts into a shared channel
    pub(crate) fn attached(
        id: usize,
        spawner: Arc<UnitSpawner>,
        inbound_tx: UnboundedSender<UnitEnvelope>,
    ) -> Self {
        Self {
            id,
            logging: LoggingFlags::default(),
            force_copy: false,
            callbacks: None,
            user_runner: None,
            job_deadline: None,
            spawner,
            unit: None,
            generation: 0,
            ready: false,
            queued: None,
            in_flight: None,
            terminate_requested: false,
            completed_runs: 0,
            stats: SupervisorStats::default(),
            inbound_tx,
            inbound_rx: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Store logging flags and the binary handoff policy
    pub fn configure(&mut self, logging: LoggingFlags, force_copy: bool) {
        self.logging = logging;
        self.force_copy = force_copy;
    }

    /// Set the callback pair; required before `run()`
    pub fn set_callbacks(
        &mut self,
        on_intermediate: IntermediateCallback,
        on_complete: CompleteCallback,
    ) {
        self.callbacks = Some((on_intermediate, on_complete));
    }

    /// Replace the default runner for units built after this call
    pub fn set_user_runner(&mut self, factory: RunnerFactory, name: impl Into<String>) {
        self.user_runner = Some((factory, name.into()));
    }

    pub fn set_job_deadline(&mut self, deadline: Option<Duration>) {
        self.job_deadline = deadline;
    }

    /// Build the unit if none exists yet. Idempotent.
    ///
    /// Construction completes on the unit thread; until it reports `ready`
    /// any job passed to `run()` is buffered.
    pub fn ensure_ready<F>(
        &mut self,
        code_builder: F,
        parser_name: &str,
        libraries: Option<&LibrarySet>,
    ) -> Result<()>
    where
        F: FnOnce() -> Result<ParserModule>,
    {
        if self.unit.is_some() {
            return Ok(());
        }

        let module = code_builder()?;
        let (runner_factory, runner_name) = match &self.user_runner {
            Some((factory, name)) => (Arc::clone(factory), name.clone()),
            None => (ParserRunner::factory(), DEFAULT_RUNNER_NAME.to_string()),
        };

        let blueprint = UnitBlueprint {
            module,
            parser_name: parser_name.to_string(),
            runner_name,
            libraries: libraries.cloned(),
        };

        let generation = self.generation + 1;
        let handle = self.spawner.spawn(
            self.id,
            generation,
            blueprint,
            runner_factory,
            self.inbound_tx.clone(),
        )?;

        if self.generation > 0 {
            self.stats.restarts += 1;
        }
        self.generation = generation;
        self.unit = Some(handle);
        self.ready = false;
        self.completed_runs = 0;

        debug!(unit_id = self.id, generation, parser = parser_name, "Unit construction started");
        Ok(())
    }

    /// Request termination once the unit has nothing to do.
    ///
    /// Tears the unit down immediately when it exists, has completed at least
    /// one run and nothing is queued or in flight. Never interrupts a job.
    pub fn set_terminate_requested(&mut self, flag: bool) {
        self.terminate_requested = flag;

        if flag
            && self.unit.is_some()
            && self.queued.is_none()
            && self.in_flight.is_none()
            && self.completed_runs > 0
        {
            debug!(unit_id = self.id, "Terminating idle unit");
            self.teardown();
        }
    }

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    /// Accept a job.
    ///
    /// Returns `Rejected` when a job is already queued or in flight.
    pub fn run(&mut self, job: Job) -> Result<RunDisposition> {
        if self.callbacks.is_none() {
            return Err(EngineError::MissingCallbacks(self.id));
        }

        if self.queued.is_some() || self.in_flight.is_some() {
            warn!(unit_id = self.id, job_id = %job.id, "Unit busy, rejecting run");
            return Ok(RunDisposition::Rejected);
        }

        let input = if self.force_copy {
            Bytes::copy_from_slice(&job.input)
        } else {
            job.input
        };

        let request = RunRequest {
            params: job.params,
            logging: self.logging,
            materials: job.materials,
            data: JobData {
                input,
                location: job.location,
                options: job.options,
            },
        };

        let now = Instant::now();
        self.in_flight = Some(InFlight {
            job_id: job.id,
            started_at: now,
            deadline: self.job_deadline.map(|d| now + d),
        });

        match &self.unit {
            Some(unit) if self.ready => {
                if let Err(e) = unit.send(UnitCommand::Run(request)) {
                    self.in_flight = None;
                    return Err(e);
                }
                trace!(unit_id = self.id, job_id = %job.id, "Job dispatched");
                Ok(RunDisposition::Dispatched)
            }
            _ => {
                trace!(unit_id = self.id, job_id = %job.id, "Job buffered until unit is ready");
                self.queued = Some(request);
                Ok(RunDisposition::Buffered)
            }
        }
    }

    /// Handle one message posted by a unit
    pub fn handle_message(&mut self, envelope: UnitEnvelope) -> MessageDisposition {
        let current = self.unit.as_ref().map(|u| u.generation);
        if envelope.unit_id != self.id || current != Some(envelope.generation) {
            trace!(
                unit_id = envelope.unit_id,
                generation = envelope.generation,
                cmd = envelope.message.cmd(),
                "Discarding message from retired unit"
            );
            return MessageDisposition::Stale;
        }

        match envelope.message {
            UnitMessage::Ready => {
                self.ready = true;
                debug!(unit_id = self.id, generation = envelope.generation, "Unit ready");
                self.flush_queued()
            }
            UnitMessage::BuildFailed { msg } => {
                error!(unit_id = self.id, error = %msg, "Unit construction failed");
                // The unit thread has already returned
                self.unit = None;
                self.ready = false;
                self.queued = None;
                if let Some(job) = self.in_flight.take() {
                    warn!(
                        unit_id = self.id,
                        job_id = %job.job_id,
                        "Dropping job buffered for failed unit"
                    );
                }
                MessageDisposition::BuildFailed
            }
            message @ UnitMessage::Complete { .. } => self.finish(message, JobOutcome::Succeeded),
            UnitMessage::Error { msg } => {
                error!(unit_id = self.id, error = %msg, "Unit reported error");
                let outcome = JobOutcome::Failed(msg.clone());
                self.finish(UnitMessage::Error { msg }, outcome)
            }
            UnitMessage::Unknown => {
                warn!(unit_id = self.id, "Protocol violation: unknown message tag");
                MessageDisposition::Ignored
            }
            message => {
                if self.in_flight.is_none() {
                    warn!(
                        unit_id = self.id,
                        cmd = message.cmd(),
                        "Intermediate result with no job in flight"
                    );
                    return MessageDisposition::Ignored;
                }
                if let Some((on_intermediate, _)) = &self.callbacks {
                    on_intermediate(&message);
                }
                MessageDisposition::Intermediate
            }
        }
    }

    fn flush_queued(&mut self) -> MessageDisposition {
        let Some(request) = self.queued.take() else {
            return MessageDisposition::Ready;
        };
        let Some(unit) = &self.unit else {
            return MessageDisposition::Ready;
        };

        match unit.send(UnitCommand::Run(request)) {
            Ok(()) => MessageDisposition::Ready,
            Err(e) => {
                error!(unit_id = self.id, error = %e, "Failed to flush buffered job");
                let msg = e.to_string();
                self.finish(UnitMessage::Error { msg: msg.clone() }, JobOutcome::Failed(msg))
            }
        }
    }

    fn finish(&mut self, message: UnitMessage, outcome: JobOutcome) -> MessageDisposition {
        let Some(job) = self.in_flight.take() else {
            warn!(unit_id = self.id, cmd = message.cmd(), "Completion with no job in flight");
            return MessageDisposition::Ignored;
        };

        self.completed_runs += 1;
        self.stats.jobs_completed += 1;

        debug!(
            unit_id = self.id,
            job_id = %job.job_id,
            success = outcome.is_success(),
            elapsed_ms = job.started_at.elapsed().as_millis() as u64,
            "Job finished"
        );

        let completion = Completion {
            job_id: job.job_id,
            outcome: outcome.clone(),
            message,
        };
        if let Some((_, on_complete)) = &self.callbacks {
            on_complete(&completion);
        }

        if self.terminate_requested {
            self.teardown();
        }

        MessageDisposition::Completed(outcome)
    }

    /// Expire the job in flight if its deadline has passed.
    ///
    /// The unit is torn down and rebuilt on the next `ensure_ready`; the
    /// completion fires with `TimedOut`. Returns whether a job expired.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        let expired = matches!(
            &self.in_flight,
            Some(InFlight { deadline: Some(at), .. }) if *at <= now
        );
        if !expired {
            return false;
        }
        let Some(job) = self.in_flight.take() else {
            return false;
        };

        warn!(
            unit_id = self.id,
            job_id = %job.job_id,
            elapsed_ms = job.started_at.elapsed().as_millis() as u64,
            "Job deadline exceeded, replacing unit"
        );

        self.queued = None;
        self.retire_unit();
        self.stats.jobs_timed_out += 1;

        let completion = Completion {
            job_id: job.job_id,
            outcome: JobOutcome::TimedOut,
            message: UnitMessage::Error {
                msg: "job deadline exceeded".to_string(),
            },
        };
        if let Some((_, on_complete)) = &self.callbacks {
            on_complete(&completion);
        }
        true
    }

    /// Deadline of the job in flight, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().and_then(|job| job.deadline)
    }

    /// Terminate the unit unconditionally and return to Uninitialized.
    ///
    /// A job in flight or buffered is abandoned without its callback.
    pub fn teardown(&mut self) {
        if let Some(job) = self.in_flight.take() {
            warn!(unit_id = self.id, job_id = %job.job_id, "Abandoning job on teardown");
        }
        self.queued = None;
        self.retire_unit();
    }

    fn retire_unit(&mut self) {
        if let Some(unit) = self.unit.take() {
            debug!(unit_id = self.id, generation = unit.generation, "Unit torn down");
            unit.terminate();
        }
        self.ready = false;
        self.completed_runs = 0;
    }

    pub fn state(&self) -> SupervisorState {
        if self.in_flight.is_some() {
            SupervisorState::Busy
        } else if self.unit.is_none() {
            SupervisorState::Uninitialized
        } else if !self.ready {
            SupervisorState::Building
        } else {
            SupervisorState::Idle
        }
    }

    /// Whether a job is queued or in flight
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_unit(&self) -> bool {
        self.unit.is_some()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    /// Wait for and handle the next unit message of a standalone supervisor.
    ///
    /// Expires the job in flight when its deadline passes first. Returns
    /// `None` for supervisors driven by a pool.
    pub async fn next_event(&mut self) -> Option<MessageDisposition> {
        loop {
            let deadline = self.next_deadline();
            let rx = self.inbound_rx.as_mut()?;

            let received = match deadline {
                Some(at) => tokio::time::timeout_at(at.into(), rx.recv()).await.ok(),
                None => Some(rx.recv().await),
            };

            match received {
                Some(Some(envelope)) => return Some(self.handle_message(envelope)),
                Some(None) => return None,
                None => {
                    if self.check_deadline(Instant::now()) {
                        return Some(MessageDisposition::Completed(JobOutcome::TimedOut));
                    }
                }
            }
        }
    }

    /// Pump messages until no job is in flight
    pub async fn run_until_idle(&mut self) {
        while self.is_busy() {
            if self.next_event().await.is_none() {
                break;
            }
        }
    }
}

impl Drop for UnitSupervisor {
    fn drop(&mut self) {
        self.retire_unit();
    }
}
