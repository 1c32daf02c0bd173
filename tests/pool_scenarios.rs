// tests/pool_scenarios.rs
//! End-to-end pool scenarios with in-test parsers

use offload_engine::runtime::{
    parser_loader_factory, CallbackBag, Completion, Instruction, Job, JobOutcome, LibrarySet,
    Loader, LoaderFactory, LoggingFlags, ModuleRegistry, ParseSink, Parser, ParserModule,
    ParserRunner, PoolDirector, PoolLimits, PoolOptions, ProgressEvent, ResourceFetcher,
    RunDisposition, Runner, RunRequest, SpawnConfig, StaticFetcher, SupervisorState, UnitMessage,
    UnitOutbox, UnitSupervisor,
};
use offload_engine::runtime::packager::UnitImage;
use offload_engine::runtime::protocol::Payload;
use bytes::Bytes;
use offload_engine::{EngineError, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Line statistics parser.
///
/// `hang` sleeps past any test deadline, `panic` panics, anything else is
/// split into lines, each reported as a mesh.
#[derive(Default)]
struct LineStats {
    tracker: Option<Arc<ThreadTracker>>,
}

impl Parser for LineStats {
    fn parse(
        &mut self,
        input: &[u8],
        _options: Option<&Value>,
        sink: &mut dyn ParseSink,
    ) -> Result<Value> {
        let _guard = self.tracker.as_ref().map(|t| t.enter());

        match input {
            b"hang" => std::thread::sleep(Duration::from_millis(400)),
            b"panic" => panic!("unsupported vertex layout"),
            _ => {}
        }

        let text = std::str::from_utf8(input).map_err(|e| EngineError::Parse(e.to_string()))?;
        let mut lines = 0;
        for line in text.lines() {
            lines += 1;
            sink.intermediate(UnitMessage::MeshData {
                data: Payload::new(json!({ "name": line })),
            });
        }
        std::thread::sleep(Duration::from_millis(5));
        Ok(json!({ "lines": lines, "bytes": input.len() }))
    }
}

/// Counts concurrent parses per unit thread
#[derive(Default)]
struct ThreadTracker {
    active: Mutex<HashMap<String, usize>>,
    violated: AtomicBool,
}

struct TrackerGuard<'a> {
    tracker: &'a ThreadTracker,
    thread: String,
}

impl ThreadTracker {
    fn enter(&self) -> TrackerGuard<'_> {
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();
        let mut active = self.active.lock().unwrap();
        let count = active.entry(thread.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            self.violated.store(true, Ordering::SeqCst);
        }
        TrackerGuard {
            tracker: self,
            thread,
        }
    }
}

impl Drop for TrackerGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.tracker.active.lock().unwrap();
        if let Some(count) = active.get_mut(&self.thread) {
            *count -= 1;
        }
    }
}

fn registry(tracker: Option<Arc<ThreadTracker>>) -> Arc<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry.register(ParserModule::new("LineStats", move || {
        Box::new(LineStats {
            tracker: tracker.clone(),
        })
    }));
    Arc::new(registry)
}

fn director(
    registry: Arc<ModuleRegistry>,
    libraries: Option<LibrarySet>,
    limits: PoolLimits,
    callbacks: CallbackBag,
) -> PoolDirector {
    director_with(
        parser_loader_factory(registry, "LineStats", libraries),
        Arc::new(StaticFetcher::new()),
        PoolOptions {
            logging: LoggingFlags::default(),
            limits,
            force_copy: false,
            callbacks,
        },
    )
}

fn director_with(
    factory: LoaderFactory,
    fetcher: Arc<dyn ResourceFetcher>,
    options: PoolOptions,
) -> PoolDirector {
    let mut director = PoolDirector::new(factory)
        .unwrap()
        .with_spawner(SpawnConfig::default(), fetcher);
    director.configure(options).unwrap();
    director
}

async fn run_to_idle(director: &mut PoolDirector) {
    tokio::time::timeout(Duration::from_secs(20), director.run_until_idle())
        .await
        .expect("pool did not become idle");
}

type Outcomes = Arc<Mutex<Vec<(String, JobOutcome)>>>;

fn labelled(label: &str, input: &'static str, outcomes: &Outcomes) -> Instruction {
    let sink = Arc::clone(outcomes);
    let name = label.to_string();
    Instruction::new(label)
        .with_input(input)
        .with_callbacks(CallbackBag::new().with_complete(move |c: &Completion| {
            sink.lock().unwrap().push((name.clone(), c.outcome.clone()));
        }))
}

#[tokio::test]
async fn two_slots_five_instructions() {
    let closing = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let outcomes: Outcomes = Arc::default();

    let closing_count = Arc::clone(&closing);
    let global = CallbackBag::new().with_progress(move |event: &ProgressEvent| {
        if event.terminal {
            assert!(event.text.is_empty());
            closing_count.fetch_add(1, Ordering::SeqCst);
        }
    });

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(2, 8).without_deadline(),
        global,
    );
    assert_eq!(director.slot_count(), 2);

    for i in 1..=5 {
        assert!(director.enqueue(labelled(&format!("#{}", i), "v 0 0 0\nv 1 0 0", &outcomes)));
    }
    let done = Arc::clone(&finished);
    director.on_finished(move || {
        done.fetch_add(1, Ordering::SeqCst);
    });

    director.drive();
    assert_eq!(director.busy_slots(), 2);
    assert_eq!(director.pending(), 3);

    run_to_idle(&mut director).await;

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(|(_, o)| o.is_success()));

    let stats = director.stats();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.slots, 0);
    assert!(!director.is_active());
    assert_eq!(closing.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn global_callbacks_fire_before_instruction_callbacks() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let global_order = Arc::clone(&order);
    let global = CallbackBag::new().with_complete(move |_: &Completion| {
        global_order.lock().unwrap().push("global");
    });

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(1, 4).without_deadline(),
        global,
    );

    let local_order = Arc::clone(&order);
    director.enqueue(
        Instruction::new("mesh")
            .with_input("v 0 0 0")
            .with_callbacks(CallbackBag::new().with_complete(move |_: &Completion| {
                local_order.lock().unwrap().push("instruction");
            })),
    );

    run_to_idle(&mut director).await;
    assert_eq!(*order.lock().unwrap(), vec!["global", "instruction"]);
}

#[tokio::test]
async fn at_most_one_job_in_flight_per_unit() {
    let tracker = Arc::new(ThreadTracker::default());
    let outcomes: Outcomes = Arc::default();

    let mut director = director(
        registry(Some(Arc::clone(&tracker))),
        None,
        PoolLimits::new(3, 32).without_deadline(),
        CallbackBag::default(),
    );
    for i in 0..12 {
        director.enqueue(labelled(&format!("job-{}", i), "a\nb\nc", &outcomes));
    }

    run_to_idle(&mut director).await;

    assert_eq!(outcomes.lock().unwrap().len(), 12);
    assert!(!tracker.violated.load(Ordering::SeqCst));
    // Every parse ran on a unit thread
    let threads = tracker.active.lock().unwrap();
    assert!(threads.keys().all(|name| name.starts_with("offload-unit-")));
}

#[tokio::test]
async fn drain_and_stop_lets_in_flight_jobs_finish() {
    let finished = Arc::new(AtomicUsize::new(0));
    let outcomes: Outcomes = Arc::default();

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(2, 16).without_deadline(),
        CallbackBag::default(),
    );
    for i in 0..6 {
        director.enqueue(labelled(&format!("job-{}", i), "line", &outcomes));
    }

    director.drive();
    assert_eq!(director.busy_slots(), 2);

    let done = Arc::clone(&finished);
    director.drain_and_stop(move || {
        done.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(director.pending(), 0);
    assert!(director.is_active());
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    run_to_idle(&mut director).await;

    assert!(!director.is_active());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.lock().unwrap().len(), 2);
    assert_eq!(director.stats().queue.drained, 4);
}

#[tokio::test]
async fn pool_result_matches_direct_parse() {
    let input = "v 0 0 0\nv 1 0 0\nf 1 2 3";

    struct Collect(Vec<UnitMessage>);
    impl ParseSink for Collect {
        fn intermediate(&mut self, message: UnitMessage) {
            self.0.push(message);
        }
        fn progress(&mut self, _text: &str) {}
    }

    let mut direct_sink = Collect(Vec::new());
    let direct = LineStats::default()
        .parse(input.as_bytes(), None, &mut direct_sink)
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    let meshes = Arc::new(Mutex::new(Vec::new()));
    let (r, m) = (Arc::clone(&results), Arc::clone(&meshes));

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(1, 1).without_deadline(),
        CallbackBag::default(),
    );
    director.enqueue(
        Instruction::new("roundtrip").with_input(input).with_callbacks(
            CallbackBag::new()
                .with_intermediate(move |msg: &UnitMessage| m.lock().unwrap().push(msg.clone()))
                .with_complete(move |c: &Completion| r.lock().unwrap().push(c.data().cloned())),
        ),
    );
    run_to_idle(&mut director).await;

    assert_eq!(*results.lock().unwrap(), vec![Some(direct)]);
    assert_eq!(*meshes.lock().unwrap(), direct_sink.0);
}

#[tokio::test]
async fn hung_job_times_out_and_unit_is_replaced() {
    let outcomes: Outcomes = Arc::default();

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(1, 4).with_deadline(Duration::from_millis(100)),
        CallbackBag::default(),
    );
    director.enqueue(labelled("hung", "hang", &outcomes));
    director.enqueue(labelled("after", "v 0 0 0", &outcomes));

    run_to_idle(&mut director).await;

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(
        *outcomes,
        vec![
            ("hung".to_string(), JobOutcome::TimedOut),
            ("after".to_string(), JobOutcome::Succeeded),
        ]
    );
    assert_eq!(director.stats().timed_out, 1);
}

#[tokio::test]
async fn library_fetch_failure_never_completes_but_pool_stays_live() {
    let outcomes: Outcomes = Arc::default();
    let finished = Arc::new(AtomicUsize::new(0));

    let mut director = director(
        registry(None),
        Some(LibrarySet::new(["draco_decoder.js"]).with_base_path("libs/")),
        PoolLimits::new(1, 4).without_deadline(),
        CallbackBag::default(),
    );
    director.enqueue(labelled("a", "x", &outcomes));
    director.enqueue(labelled("b", "y", &outcomes));
    let done = Arc::clone(&finished);
    director.on_finished(move || {
        done.fetch_add(1, Ordering::SeqCst);
    });

    run_to_idle(&mut director).await;

    assert!(outcomes.lock().unwrap().is_empty());
    assert_eq!(director.stats().build_failures, 2);
    assert_eq!(director.stats().completed, 0);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parser_panic_is_reported_as_failure() {
    let outcomes: Outcomes = Arc::default();

    let mut director = director(
        registry(None),
        None,
        PoolLimits::new(1, 4).without_deadline(),
        CallbackBag::default(),
    );
    director.enqueue(labelled("bad", "panic", &outcomes));
    director.enqueue(labelled("good", "v", &outcomes));

    run_to_idle(&mut director).await;

    let outcomes = outcomes.lock().unwrap();
    assert!(matches!(
        &outcomes[0],
        (label, JobOutcome::Failed(msg))
            if label == "bad" && msg.contains("unsupported vertex layout")
    ));
    // The unit survives the panic
    assert_eq!(outcomes[1], ("good".to_string(), JobOutcome::Succeeded));
    assert_eq!(director.stats().failed, 1);
}

/// Runner that emits an unrecognised message before delegating
struct ChattyRunner(ParserRunner);

impl Runner for ChattyRunner {
    fn run(&mut self, request: RunRequest, image: &UnitImage, outbox: &UnitOutbox) {
        outbox.post_line(r#"{"cmd":"telemetry","load":0.9}"#);
        self.0.run(request, image, outbox);
    }
}

/// Loader installing [`ChattyRunner`] on its supervisor
#[derive(Default)]
struct ChattyLoader {
    instance_no: usize,
    callbacks: CallbackBag,
}

impl Loader for ChattyLoader {
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
        let complete = self.callbacks.clone();
        supervisor.set_callbacks(
            Arc::new(|_: &UnitMessage| {}),
            Arc::new(move |c: &Completion| complete.complete(c)),
        );
        supervisor.set_user_runner(
            Arc::new(|| Box::new(ChattyRunner(ParserRunner::new())) as Box<dyn Runner>),
            "ChattyRunner",
        );
        supervisor.ensure_ready(
            || registry(None).resolve("LineStats"),
            "LineStats",
            None,
        )?;
        let input = instruction.input.unwrap_or_default();
        supervisor.run(Job::new(input))?;
        Ok(())
    }
}

#[tokio::test]
async fn unknown_message_tag_does_not_disturb_the_job() {
    let outcomes: Outcomes = Arc::default();

    let mut director = PoolDirector::new(Box::new(|_| {
        Ok(Box::new(ChattyLoader::default()) as Box<dyn Loader>)
    }))
    .unwrap()
    .with_spawner(SpawnConfig::default(), Arc::new(StaticFetcher::new()));
    director
        .configure(PoolOptions {
            limits: PoolLimits::new(1, 2).without_deadline(),
            ..Default::default()
        })
        .unwrap();

    director.enqueue(labelled("chatty", "a\nb", &outcomes));
    run_to_idle(&mut director).await;

    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![("chatty".to_string(), JobOutcome::Succeeded)]
    );
}

#[tokio::test]
async fn duplicate_run_is_rejected_and_first_job_completes() {
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);

    let mut supervisor = UnitSupervisor::with_spawner(
        0,
        Arc::new(offload_engine::runtime::UnitSpawner::new(
            SpawnConfig::default(),
            Arc::new(StaticFetcher::new()),
        )),
    );
    supervisor.set_callbacks(
        Arc::new(|_: &UnitMessage| {}),
        Arc::new(move |c: &Completion| {
            assert!(c.outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    supervisor
        .ensure_ready(|| registry(None).resolve("LineStats"), "LineStats", None)
        .unwrap();

    assert_eq!(supervisor.run(Job::new("first")).unwrap(), RunDisposition::Buffered);
    assert_eq!(supervisor.run(Job::new("second")).unwrap(), RunDisposition::Rejected);

    tokio::time::timeout(Duration::from_secs(10), supervisor.run_until_idle())
        .await
        .unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    // Idle with a completed run: termination is immediate
    supervisor.set_terminate_requested(true);
    assert_eq!(supervisor.state(), SupervisorState::Uninitialized);
}

/// Fetcher that takes its time for every resource
struct SlowFetcher {
    delay: Duration,
    inner: StaticFetcher,
}

impl ResourceFetcher for SlowFetcher {
    fn load(&self, url: &str) -> Result<Bytes> {
        std::thread::sleep(self.delay);
        self.inner.load(url)
    }
}

#[tokio::test]
async fn input_fetch_runs_on_unit_threads() {
    let outcomes: Outcomes = Arc::default();
    let fetcher = SlowFetcher {
        delay: Duration::from_millis(300),
        inner: StaticFetcher::new().with_entry("models/a.obj", "v 0 0 0\nv 1 0 0"),
    };

    let mut director = director_with(
        parser_loader_factory(registry(None), "LineStats", None),
        Arc::new(fetcher),
        PoolOptions {
            limits: PoolLimits::new(4, 8).without_deadline(),
            ..Default::default()
        },
    );
    for i in 0..4 {
        let sink = Arc::clone(&outcomes);
        let label = format!("a-{}", i);
        director.enqueue(
            Instruction::new(label.clone())
                .with_resources(["models/a.obj"])
                .with_callbacks(CallbackBag::new().with_complete(move |c: &Completion| {
                    sink.lock().unwrap().push((label.clone(), c.outcome.clone()));
                })),
        );
    }

    let started = Instant::now();
    director.drive();
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "drive() waited on the fetcher for {:?}",
        started.elapsed()
    );
    assert_eq!(director.busy_slots(), 4);

    run_to_idle(&mut director).await;

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_success()));
}

/// Reports the address of the buffer it was handed
struct AddressParser;

impl Parser for AddressParser {
    fn parse(
        &mut self,
        input: &[u8],
        _options: Option<&Value>,
        _sink: &mut dyn ParseSink,
    ) -> Result<Value> {
        Ok(json!({ "address": input.as_ptr() as usize }))
    }
}

async fn parsed_address(source: Bytes, force_copy: bool) -> usize {
    let mut registry = ModuleRegistry::new();
    registry.register(ParserModule::new("AddressParser", || Box::new(AddressParser)));

    let addresses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&addresses);
    let mut director = director_with(
        parser_loader_factory(Arc::new(registry), "AddressParser", None),
        Arc::new(StaticFetcher::new()),
        PoolOptions {
            limits: PoolLimits::new(1, 1).without_deadline(),
            force_copy,
            callbacks: CallbackBag::new().with_complete(move |c: &Completion| {
                if let Some(address) = c.data().and_then(|d| d["address"].as_u64()) {
                    sink.lock().unwrap().push(address as usize);
                }
            }),
            ..Default::default()
        },
    );
    director.enqueue(Instruction::new("buffer").with_input(source));
    run_to_idle(&mut director).await;

    let addresses = addresses.lock().unwrap();
    assert_eq!(addresses.len(), 1);
    addresses[0]
}

#[tokio::test]
async fn force_copy_reaches_every_unit() {
    let source = Bytes::from(vec![7u8; 64]);
    let original = source.as_ptr() as usize;

    assert_eq!(parsed_address(source.clone(), false).await, original);
    assert_ne!(parsed_address(source, true).await, original);
}
