// src/runtime/worker_pool.rs
//! Bounded pool of execution units
//!
//! The director owns N supervisors and a bounded FIFO of instructions. It
//! dispatches instructions to idle slots, re-drives when a job finishes,
//! deregisters slots once the queue is exhausted and drains on request.
//!
//! # Architecture
//!
//! ```text
//! PoolDirector
//! ├─ Queue: [Instr5, Instr4, Instr3]        (bounded, M ≤ 8192)
//! ├─ Slot 0: Loader ─▶ UnitSupervisor ─▶ unit thread
//! ├─ Slot 1: Loader ─▶ UnitSupervisor ─▶ unit thread   (N ≤ 16)
//! └─ Inbound: ◀── UnitEnvelope {unit_id, generation, message}
//! ```
//!
//! Everything on the orchestrating side runs in one event loop
//! ([`PoolDirector::run_until_idle`]): message handling, callbacks and
//! `drive()`. A finished job marks the pool for a re-drive on the next loop
//! turn instead of calling `drive()` recursively.

use crate::observability::{
    METRIC_INSTRUCTIONS_DISPATCHED, METRIC_INSTRUCTIONS_DROPPED, METRIC_JOBS_COMPLETED,
    METRIC_JOBS_FAILED, METRIC_JOBS_TIMED_OUT, METRIC_SLOTS_REGISTERED, METRIC_UNIT_BUILD_FAILURES,
};
use crate::runtime::fetch::ResourceFetcher;
use crate::runtime::instruction_queue::{InstructionQueue, QueueStats};
use crate::runtime::limits::PoolLimits;
use crate::runtime::protocol::{
    Completion, JobId, JobOutcome, LoggingFlags, SettingsBag, UnitEnvelope, UnitMessage,
};
use crate::runtime::supervisor::{
    CompleteCallback, IntermediateCallback, MessageDisposition, UnitSupervisor,
};
use crate::runtime::unit_spawner::{SpawnConfig, UnitSpawner};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use metrics::{counter, gauge};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

/// Receives progress notifications
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Fires once when the pool becomes inactive
pub type FinishCallback = Box<dyn FnOnce() + Send>;

/// Produces the loader for a slot index
pub type LoaderFactory = Box<dyn Fn(usize) -> Result<Box<dyn Loader>> + Send + Sync>;

/// Progress notification from a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub slot: usize,
    pub text: String,
    /// Set on the closing notification sent when a slot deregisters
    pub terminal: bool,
}

/// Optional callbacks attached to the pool or to one instruction
#[derive(Clone, Default)]
pub struct CallbackBag {
    pub on_progress: Option<ProgressCallback>,
    pub on_intermediate: Option<IntermediateCallback>,
    pub on_complete: Option<CompleteCallback>,
}

impl fmt::Debug for CallbackBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBag")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_intermediate", &self.on_intermediate.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl CallbackBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn with_intermediate<F>(mut self, f: F) -> Self
    where
        F: Fn(&UnitMessage) + Send + Sync + 'static,
    {
        self.on_intermediate = Some(Arc::new(f));
        self
    }

    pub fn with_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Completion) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Combine two bags; `first` fires before `then` for every callback
    pub fn chain(first: &CallbackBag, then: &CallbackBag) -> CallbackBag {
        CallbackBag {
            on_progress: chain_one(&first.on_progress, &then.on_progress),
            on_intermediate: chain_one(&first.on_intermediate, &then.on_intermediate),
            on_complete: chain_one(&first.on_complete, &then.on_complete),
        }
    }

    pub fn progress(&self, event: &ProgressEvent) {
        if let Some(f) = &self.on_progress {
            f(event);
        }
    }

    pub fn intermediate(&self, message: &UnitMessage) {
        if let Some(f) = &self.on_intermediate {
            f(message);
        }
    }

    pub fn complete(&self, completion: &Completion) {
        if let Some(f) = &self.on_complete {
            f(completion);
        }
    }
}

fn chain_one<A: ?Sized + 'static>(
    first: &Option<Arc<dyn Fn(&A) + Send + Sync>>,
    then: &Option<Arc<dyn Fn(&A) + Send + Sync>>,
) -> Option<Arc<dyn Fn(&A) + Send + Sync>> {
    match (first, then) {
        (Some(a), Some(b)) => {
            let (a, b) = (Arc::clone(a), Arc::clone(b));
            Some(Arc::new(move |arg: &A| {
                a(arg);
                b(arg);
            }))
        }
        (Some(f), None) | (None, Some(f)) => Some(Arc::clone(f)),
        (None, None) => None,
    }
}

/// Caller description of one job
#[derive(Debug, Clone, Default)]
pub struct Instruction {
    /// Free-form label for logs and progress text
    pub label: String,
    /// Resource locations the loader may use
    pub resources: Vec<String>,
    pub params: SettingsBag,
    pub materials: SettingsBag,
    pub input: Option<Bytes>,
    pub options: Option<Value>,
    pub callbacks: CallbackBag,
}

impl Instruction {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
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

    pub fn with_callbacks(mut self, callbacks: CallbackBag) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Turns an instruction into a job on a supervisor
pub trait Loader: Send {
    fn set_instance_no(&mut self, instance_no: usize);

    fn instance_no(&self) -> usize;

    fn callbacks(&self) -> &CallbackBag;

    fn set_callbacks(&mut self, callbacks: CallbackBag);

    /// Start the instruction on `supervisor`.
    ///
    /// Must leave the supervisor busy on success; the job's completion is
    /// reported through the supervisor's callbacks. An error, or success
    /// without a busy supervisor, completes the instruction as failed.
    fn run(&mut self, instruction: Instruction, supervisor: &mut UnitSupervisor) -> Result<()>;
}

/// Pool configuration surface
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub logging: LoggingFlags,
    pub limits: PoolLimits,
    pub force_copy: bool,
    /// Fire before each instruction's own callbacks
    pub callbacks: CallbackBag,
}

impl PoolOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            logging: LoggingFlags::new(config.logging.unit_logging, config.logging.unit_debug),
            limits: config.pool.clone(),
            force_copy: config.runtime.force_copy,
            callbacks: CallbackBag::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: CallbackBag) -> Self {
        self.callbacks = callbacks;
        self
    }
}

struct Slot {
    supervisor: UnitSupervisor,
    loader: Option<Box<dyn Loader>>,
    in_use: bool,
    terminate_requested: bool,
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots still registered
    pub slots: usize,
    /// Slots with a job in flight
    pub busy_slots: usize,
    /// Jobs finished, whatever the outcome
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Units whose construction failed
    pub build_failures: u64,
    pub queue: QueueStats,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    succeeded: u64,
    failed: u64,
    timed_out: u64,
    build_failures: u64,
}

/// Pool scheduler over a fixed set of supervisors
pub struct PoolDirector {
    factory: LoaderFactory,
    spawner: Arc<UnitSpawner>,
    slots: BTreeMap<usize, Slot>,
    queue: InstructionQueue<Instruction>,
    global_callbacks: CallbackBag,
    on_finished: Option<FinishCallback>,
    redrive: bool,
    counters: Counters,
    inbound_tx: UnboundedSender<UnitEnvelope>,
    inbound_rx: UnboundedReceiver<UnitEnvelope>,
}

impl PoolDirector {
    /// Create a director, checking the loader factory.
    ///
    /// The pool has no slots until [`PoolDirector::configure`] is called.
    pub fn new(factory: LoaderFactory) -> Result<Self> {
        let mut sample = factory(0).map_err(|e| {
            EngineError::InvalidLoaderFactory(format!("factory failed for slot 0: {}", e))
        })?;
        sample.set_instance_no(usize::MAX);
        if sample.instance_no() != usize::MAX {
            return Err(EngineError::InvalidLoaderFactory(
                "loader does not keep its instance number".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            factory,
            spawner: Arc::new(UnitSpawner::default()),
            slots: BTreeMap::new(),
            queue: InstructionQueue::new(1),
            global_callbacks: CallbackBag::default(),
            on_finished: None,
            redrive: false,
            counters: Counters::default(),
            inbound_tx,
            inbound_rx,
        })
    }

    /// Use a custom spawner for units; call before `configure`
    pub fn with_spawner(mut self, config: SpawnConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.spawner = Arc::new(UnitSpawner::new(config, fetcher));
        self
    }

    /// Build the slots and reset queue, counters and finish callback.
    ///
    /// Creates `min(max_workers, max_queue_size)` slots; zero sizes are
    /// rejected and sizes above the supported maxima are clamped.
    pub fn configure(&mut self, options: PoolOptions) -> Result<()> {
        options
            .limits
            .validate()
            .map_err(EngineError::InvalidPoolConfig)?;
        let limits = options.limits.clamped();

        // Units of a previous configuration post into the old channel
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.inbound_tx = inbound_tx;
        self.inbound_rx = inbound_rx;

        self.slots.clear();
        self.queue = InstructionQueue::new(limits.max_queue_size);
        self.global_callbacks = options.callbacks;
        self.on_finished = None;
        self.redrive = false;
        self.counters = Counters::default();

        for index in 0..limits.slot_count() {
            let mut supervisor =
                UnitSupervisor::attached(index, Arc::clone(&self.spawner), self.inbound_tx.clone());
            supervisor.configure(options.logging, options.force_copy);
            supervisor.set_job_deadline(limits.job_deadline());

            self.slots.insert(
                index,
                Slot {
                    supervisor,
                    loader: None,
                    in_use: false,
                    terminate_requested: false,
                },
            );
        }

        gauge!(METRIC_SLOTS_REGISTERED).set(self.slots.len() as f64);
        info!(
            slots = self.slots.len(),
            queue_capacity = limits.max_queue_size,
            force_copy = options.force_copy,
            "Worker pool configured"
        );
        Ok(())
    }

    /// Append an instruction; drops it (returning false) when the queue is full
    pub fn enqueue(&mut self, instruction: Instruction) -> bool {
        match self.queue.push(instruction) {
            Ok(()) => true,
            Err(instruction) => {
                warn!(
                    label = %instruction.label,
                    capacity = self.queue.capacity(),
                    "Instruction queue full, dropping instruction"
                );
                counter!(METRIC_INSTRUCTIONS_DROPPED).increment(1);
                false
            }
        }
    }

    /// Pending instructions remain or a slot is still registered
    pub fn is_active(&self) -> bool {
        !self.queue.is_empty() || !self.slots.is_empty()
    }

    /// Register a callback fired once the pool becomes inactive
    pub fn on_finished<F>(&mut self, on_finished: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finished = Some(Box::new(on_finished));
    }

    /// Scheduling tick.
    ///
    /// Every free slot takes the next instruction, or deregisters when none
    /// remain. Fires the finish callback once the pool is inactive.
    pub fn drive(&mut self) {
        self.redrive = false;

        let free: Vec<usize> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.in_use)
            .map(|(index, _)| *index)
            .collect();

        for index in free {
            let terminating = self
                .slots
                .get(&index)
                .map_or(true, |slot| slot.terminate_requested);

            if terminating {
                self.deregister(index);
                continue;
            }
            match self.queue.pop() {
                Some(instruction) => self.dispatch(index, instruction),
                None => self.deregister(index),
            }
        }

        if !self.is_active() {
            if let Some(on_finished) = self.on_finished.take() {
                info!(completed = self.counters.completed, "Worker pool finished");
                on_finished();
            }
        }
    }

    fn dispatch(&mut self, index: usize, instruction: Instruction) {
        let Some(slot) = self.slots.get_mut(&index) else {
            return;
        };
        slot.in_use = true;
        counter!(METRIC_INSTRUCTIONS_DISPATCHED).increment(1);

        let label = instruction.label.clone();
        let callbacks = CallbackBag::chain(&self.global_callbacks, &instruction.callbacks);

        let result = (self.factory)(index).and_then(|mut loader| {
            loader.set_instance_no(index);
            loader.set_callbacks(callbacks.clone());
            let started = loader.run(instruction, &mut slot.supervisor);
            slot.loader = Some(loader);
            started
        });

        let failure = match result {
            Ok(()) if slot.supervisor.is_busy() => {
                debug!(slot = index, label = %label, "Instruction dispatched");
                return;
            }
            Ok(()) => {
                warn!(slot = index, label = %label, "Loader returned without starting a job");
                EngineError::Loader(format!("no job started for instruction '{}'", label))
            }
            Err(e) => {
                error!(slot = index, label = %label, error = %e, "Failed to dispatch instruction");
                if slot.supervisor.is_busy() {
                    slot.supervisor.teardown();
                }
                e
            }
        };

        slot.in_use = false;
        self.redrive = true;

        let msg = failure.to_string();
        let completion = Completion {
            job_id: JobId::new(),
            outcome: JobOutcome::Failed(msg.clone()),
            message: UnitMessage::Error { msg },
        };
        self.record_outcome(&completion.outcome);
        callbacks.complete(&completion);
    }

    fn deregister(&mut self, index: usize) {
        let Some(mut slot) = self.slots.remove(&index) else {
            return;
        };

        if let Some(loader) = &slot.loader {
            loader.callbacks().progress(&ProgressEvent {
                slot: index,
                text: String::new(),
                terminal: true,
            });
        }
        slot.supervisor.set_terminate_requested(true);

        gauge!(METRIC_SLOTS_REGISTERED).set(self.slots.len() as f64);
        debug!(slot = index, remaining = self.slots.len(), "Slot deregistered");
    }

    /// Stop dispatching and let in-flight jobs finish.
    ///
    /// Pending instructions are dropped and every slot terminates after its
    /// current job. `on_finished` fires once the pool is inactive.
    pub fn drain_and_stop<F>(&mut self, on_finished: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let dropped = self.queue.drain_pending();
        info!(dropped, slots = self.slots.len(), "Draining worker pool");

        self.on_finished = Some(Box::new(on_finished));
        for slot in self.slots.values_mut() {
            slot.terminate_requested = true;
            slot.supervisor.set_terminate_requested(true);
        }

        self.drive();
    }

    /// Route one unit message to its slot
    pub fn handle_envelope(&mut self, envelope: UnitEnvelope) {
        let index = envelope.unit_id;
        let Some(slot) = self.slots.get_mut(&index) else {
            trace!(slot = index, cmd = envelope.message.cmd(), "Message for deregistered slot");
            return;
        };

        match slot.supervisor.handle_message(envelope) {
            MessageDisposition::Completed(outcome) => {
                slot.in_use = false;
                self.redrive = true;
                self.record_outcome(&outcome);
            }
            MessageDisposition::BuildFailed => {
                // No completion fires for a job whose unit never came up
                slot.in_use = false;
                self.redrive = true;
                self.counters.build_failures += 1;
                counter!(METRIC_UNIT_BUILD_FAILURES).increment(1);
            }
            _ => {}
        }
    }

    fn expire_deadlines(&mut self, now: Instant) {
        let mut expired = 0;
        for (index, slot) in self.slots.iter_mut() {
            if slot.in_use && slot.supervisor.check_deadline(now) {
                warn!(slot = *index, "Job timed out");
                slot.in_use = false;
                expired += 1;
            }
        }
        for _ in 0..expired {
            self.record_outcome(&JobOutcome::TimedOut);
        }
        if expired > 0 {
            self.redrive = true;
        }
    }

    fn record_outcome(&mut self, outcome: &JobOutcome) {
        self.counters.completed += 1;
        counter!(METRIC_JOBS_COMPLETED).increment(1);
        match outcome {
            JobOutcome::Succeeded => self.counters.succeeded += 1,
            JobOutcome::Failed(_) => {
                self.counters.failed += 1;
                counter!(METRIC_JOBS_FAILED).increment(1);
            }
            JobOutcome::TimedOut => {
                self.counters.timed_out += 1;
                counter!(METRIC_JOBS_TIMED_OUT).increment(1);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| slot.supervisor.next_deadline())
            .min()
    }

    fn any_in_use(&self) -> bool {
        self.slots.values().any(|slot| slot.in_use)
    }

    /// Run the event loop until the pool is inactive.
    ///
    /// Drives once up front, then handles unit messages and job deadlines,
    /// re-driving after every finished job.
    pub async fn run_until_idle(&mut self) {
        loop {
            if self.redrive || !self.any_in_use() {
                self.drive();
            }
            if !self.is_active() {
                break;
            }
            if self.slots.is_empty() {
                warn!(pending = self.queue.len(), "No slots left to run pending instructions");
                break;
            }
            if self.redrive {
                continue;
            }

            let deadline = self.next_deadline();
            let received = match deadline {
                Some(at) => tokio::time::timeout_at(at.into(), self.inbound_rx.recv())
                    .await
                    .ok(),
                None => Some(self.inbound_rx.recv().await),
            };

            match received {
                Some(Some(envelope)) => self.handle_envelope(envelope),
                // The director holds a sender, so the channel never closes
                Some(None) => break,
                None => self.expire_deadlines(Instant::now()),
            }
        }
    }

    /// Number of registered slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots with a job in flight
    pub fn busy_slots(&self) -> usize {
        self.slots.values().filter(|slot| slot.in_use).count()
    }

    /// Number of pending instructions
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots: self.slots.len(),
            busy_slots: self.busy_slots(),
            completed: self.counters.completed,
            succeeded: self.counters.succeeded,
            failed: self.counters.failed,
            timed_out: self.counters.timed_out,
            build_failures: self.counters.build_failures,
            queue: self.queue.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Loader that never touches its supervisor
    #[derive(Default)]
    struct InertLoader {
        instance_no: usize,
        callbacks: CallbackBag,
    }

    impl Loader for InertLoader {
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

        fn run(
            &mut self,
            _instruction: Instruction,
            _supervisor: &mut UnitSupervisor,
        ) -> Result<()> {
            Err(EngineError::Loader("inert loader".to_string()))
        }
    }

    /// Loader that accepts every instruction without starting a job
    #[derive(Default)]
    struct IdleLoader {
        instance_no: usize,
        callbacks: CallbackBag,
    }

    impl Loader for IdleLoader {
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

        fn run(
            &mut self,
            _instruction: Instruction,
            _supervisor: &mut UnitSupervisor,
        ) -> Result<()> {
            Ok(())
        }
    }

    /// Loader that forgets its identity
    struct ForgetfulLoader(CallbackBag);

    impl Loader for ForgetfulLoader {
        fn set_instance_no(&mut self, _instance_no: usize) {}

        fn instance_no(&self) -> usize {
            0
        }

        fn callbacks(&self) -> &CallbackBag {
            &self.0
        }

        fn set_callbacks(&mut self, callbacks: CallbackBag) {
            self.0 = callbacks;
        }

        fn run(
            &mut self,
            _instruction: Instruction,
            _supervisor: &mut UnitSupervisor,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn inert_director() -> PoolDirector {
        PoolDirector::new(Box::new(|_| Ok(Box::new(InertLoader::default()) as Box<dyn Loader>)))
            .unwrap()
    }

    fn options(workers: usize, queue: usize) -> PoolOptions {
        PoolOptions {
            limits: PoolLimits::new(workers, queue).without_deadline(),
            ..Default::default()
        }
    }

    #[test]
    fn test_factory_violating_identity_contract_is_rejected() {
        let result = PoolDirector::new(Box::new(|_| {
            Ok(Box::new(ForgetfulLoader(CallbackBag::default())) as Box<dyn Loader>)
        }));
        assert!(matches!(result, Err(EngineError::InvalidLoaderFactory(_))));
    }

    #[test]
    fn test_failing_factory_is_rejected() {
        let result = PoolDirector::new(Box::new(|_| Err(EngineError::Loader("no".into()))));
        assert!(matches!(result, Err(EngineError::InvalidLoaderFactory(_))));
    }

    #[test]
    fn test_zero_sizes_fail_fast() {
        let mut director = inert_director();
        assert!(matches!(
            director.configure(options(0, 4)),
            Err(EngineError::InvalidPoolConfig(_))
        ));
        assert!(matches!(
            director.configure(options(2, 0)),
            Err(EngineError::InvalidPoolConfig(_))
        ));
    }

    #[test]
    fn test_oversized_limits_are_clamped() {
        let mut director = inert_director();
        director.configure(options(64, 100_000)).unwrap();
        assert_eq!(director.slot_count(), 16);
        assert_eq!(director.stats().queue.capacity, 8192);
    }

    #[test]
    fn test_chain_fires_global_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&order), Arc::clone(&order));

        let global = CallbackBag::new().with_progress(move |_| a.lock().unwrap().push("global"));
        let local = CallbackBag::new().with_progress(move |_| b.lock().unwrap().push("local"));

        let chained = CallbackBag::chain(&global, &local);
        chained.progress(&ProgressEvent {
            slot: 0,
            text: "x".into(),
            terminal: false,
        });

        assert_eq!(*order.lock().unwrap(), vec!["global", "local"]);
        assert!(chained.on_complete.is_none());
    }

    #[test]
    fn test_dispatch_failure_completes_as_failed_and_keeps_scheduling() {
        let failures = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut director = inert_director();
        let counter = Arc::clone(&failures);
        director
            .configure(options(1, 4).with_callbacks(CallbackBag::new().with_complete(
                move |c: &Completion| {
                    assert!(matches!(c.outcome, JobOutcome::Failed(_)));
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )))
            .unwrap();

        for i in 0..3 {
            assert!(director.enqueue(Instruction::new(format!("job-{}", i))));
        }
        let done = Arc::clone(&finished);
        director.on_finished(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });

        // Each failed dispatch requests a re-drive
        while director.is_active() {
            director.drive();
        }

        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(director.stats().failed, 3);
        assert_eq!(director.slot_count(), 0);
    }

    #[test]
    fn test_loader_starting_no_job_completes_as_failed() {
        let labels = Arc::new(Mutex::new(Vec::new()));
        let mut director =
            PoolDirector::new(Box::new(|_| Ok(Box::new(IdleLoader::default()) as Box<dyn Loader>)))
                .unwrap();
        director.configure(options(1, 4)).unwrap();

        for label in ["first", "second"] {
            let sink = Arc::clone(&labels);
            let callbacks = CallbackBag::new().with_complete(move |c: &Completion| {
                if let JobOutcome::Failed(msg) = &c.outcome {
                    sink.lock().unwrap().push(msg.clone());
                }
            });
            director.enqueue(Instruction::new(label).with_callbacks(callbacks));
        }

        while director.is_active() {
            director.drive();
        }

        let labels = labels.lock().unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels[0].contains("first"));
        assert!(labels[1].contains("second"));
        assert_eq!(director.stats().failed, 2);
        assert_eq!(director.stats().completed, 2);
    }

    #[test]
    fn test_drain_with_no_work_finishes_immediately() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut director = inert_director();
        director.configure(options(2, 4)).unwrap();

        let done = Arc::clone(&finished);
        director.drain_and_stop(move || {
            done.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!director.is_active());
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // A second sweep never fires it again
        director.drive();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// configure creates exactly min(N, M) slots
        #[test]
        fn configure_creates_min_slots(workers in 1usize..=16, queue in 1usize..=8192) {
            let mut director = inert_director();
            director.configure(options(workers, queue)).unwrap();
            prop_assert_eq!(director.slot_count(), workers.min(queue));
        }

        /// Admission stops at the queue capacity
        #[test]
        fn enqueue_beyond_capacity_is_noop(queue in 1usize..=512) {
            let mut director = inert_director();
            director.configure(options(1, queue)).unwrap();

            for i in 0..=queue {
                let accepted = director.enqueue(Instruction::new(i.to_string()));
                prop_assert_eq!(accepted, i < queue);
            }
            prop_assert_eq!(director.pending(), queue);
        }
    }
}
