use anyhow::{anyhow, Result};
use async_trait::async_trait;
use compose_renderer::{
    composition::CompositionLimits,
    error::{EngineError, ExecutorFailure, RenderError},
    ffmpeg::{RenderEngine, RenderJob},
    jobs::{Job, JobStore},
    orchestrator::{Orchestrator, OrchestratorConfig, RenderState},
    plan::PlanGenerator,
    types::{Plan, PlanningRequest, PlanningResponse, RenderRequest, VideoMeta},
    worker::{Executor, TaskExecutor, WorkerUnit},
};
use serde_json::{json, Value};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// ---- plan generators ----

struct Ready;
#[async_trait]
impl PlanGenerator for Ready {
    async fn generate(&self, _meta: &VideoMeta, _blocks: &[Value]) -> Result<Plan> {
        Ok(Plan::default())
    }
}

struct Broken;
#[async_trait]
impl PlanGenerator for Broken {
    async fn generate(&self, _meta: &VideoMeta, _blocks: &[Value]) -> Result<Plan> {
        Err(anyhow!("could not resolve https://cdn.example.com/a.png"))
    }
}

struct Panics;
#[async_trait]
impl PlanGenerator for Panics {
    async fn generate(&self, _meta: &VideoMeta, _blocks: &[Value]) -> Result<Plan> {
        panic!("unexpected block layout")
    }
}

struct Hangs;
#[async_trait]
impl PlanGenerator for Hangs {
    async fn generate(&self, _meta: &VideoMeta, _blocks: &[Value]) -> Result<Plan> {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        Ok(Plan::default())
    }
}

// ---- executors ----

/// Unit that never answers, or crashes at once. Records kills.
#[derive(Clone, Default)]
struct Recording {
    spawned: Arc<AtomicUsize>,
    killed: Arc<AtomicBool>,
    crash: bool,
}

struct RecordingUnit {
    killed: Arc<AtomicBool>,
    crash: bool,
}

#[async_trait]
impl Executor for Recording {
    async fn spawn(&self, _request: PlanningRequest) -> Result<Box<dyn WorkerUnit>, ExecutorFailure> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingUnit { killed: self.killed.clone(), crash: self.crash }))
    }
}

#[async_trait]
impl WorkerUnit for RecordingUnit {
    async fn response(&mut self) -> Result<PlanningResponse, ExecutorFailure> {
        if self.crash {
            return Err(ExecutorFailure::Crashed { status: "signal: 9 (SIGKILL)".into() });
        }
        std::future::pending().await
    }

    async fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

struct Unstartable;
#[async_trait]
impl Executor for Unstartable {
    async fn spawn(&self, _request: PlanningRequest) -> Result<Box<dyn WorkerUnit>, ExecutorFailure> {
        Err(ExecutorFailure::Spawn(std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary")))
    }
}

// ---- engines ----

#[derive(Default)]
struct Engine {
    jobs: Mutex<Vec<RenderJob>>,
    token: Mutex<Option<CancellationToken>>,
    cleaned_up: AtomicBool,
    mode: EngineMode,
}

#[derive(Default, Clone, Copy)]
enum EngineMode {
    #[default]
    Succeed,
    Fail,
    Hang,
    SelfCancel,
    StopOnCancel,
}

#[async_trait]
impl RenderEngine for Engine {
    async fn render(&self, job: RenderJob, cancel: CancellationToken, progress: &watch::Sender<u32>) -> Result<PathBuf, EngineError> {
        let output = job.workdir.join("output.mp4");
        self.jobs.lock().unwrap().push(job);
        *self.token.lock().unwrap() = Some(cancel.clone());
        match self.mode {
            EngineMode::Succeed => {
                progress.send_replace(100);
                Ok(output)
            }
            EngineMode::Fail => Err(EngineError::Failed("encoder exploded".into())),
            EngineMode::Hang => std::future::pending().await,
            EngineMode::SelfCancel => Err(EngineError::Cancelled),
            EngineMode::StopOnCancel => {
                cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.cleaned_up.store(true, Ordering::SeqCst);
                Err(EngineError::Cancelled)
            }
        }
    }
}

fn engine(mode: EngineMode) -> Arc<Engine> {
    Arc::new(Engine { mode, ..Default::default() })
}

fn tasks(generator: impl PlanGenerator + 'static) -> Arc<dyn Executor> {
    Arc::new(TaskExecutor::new(Arc::new(generator), CompositionLimits::default()))
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        planning_timeout: Duration::from_secs(5),
        render_timeout: Duration::from_secs(60),
        cancel_grace: Duration::from_secs(2),
    }
}

fn request() -> RenderRequest {
    serde_json::from_value(json!({
        "input": {
            "videoMeta": { "aspectRatio": "16:9", "fps": 30 },
            "contentBlocks": [
                { "type": "video" },
                { "type": "motivational-image", "text": "x".repeat(90) }
            ]
        },
        "title": "Launch",
        "subtitle": "v2"
    }))
    .unwrap()
}

#[tokio::test]
async fn happy_path_completes_with_composition() {
    let eng = engine(EngineMode::Succeed);
    let orch = Orchestrator::new(tasks(Ready), eng.clone(), config());
    let (job, ctx) = Job::new(Path::new("/tmp/renders"));

    let terminal = orch.run(request(), ctx).await;
    assert_eq!(terminal, RenderState::Completed { output: job.workdir.join("output.mp4") });
    assert_eq!(job.current_state(), terminal);
    assert_eq!(*job.progress.borrow(), 100);

    let jobs = eng.jobs.lock().unwrap();
    let dispatched = &jobs[0];
    assert_eq!(dispatched.composition_config.width, 1920);
    assert_eq!(dispatched.composition_config.height, 1080);
    assert_eq!(dispatched.composition_config.duration_in_frames, 480);
    assert_eq!(dispatched.props.title, "Launch");
    assert_eq!(dispatched.input, request().input);
}

#[tokio::test]
async fn plan_failure_is_reported_and_not_dispatched() {
    let eng = engine(EngineMode::Succeed);
    let orch = Orchestrator::new(tasks(Broken), eng.clone(), config());
    let (job, ctx) = Job::new(Path::new("/tmp/renders"));

    match orch.run(request(), ctx).await {
        RenderState::Failed(RenderError::PlanFailed(msg)) => assert!(msg.contains("cdn.example.com")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(eng.jobs.lock().unwrap().is_empty());
    assert_eq!(job.to_status_response("http://h").error.unwrap().kind, "plan_failed");
}

#[tokio::test]
async fn generator_panic_is_a_plan_failure() {
    let orch = Orchestrator::new(tasks(Panics), engine(EngineMode::Succeed), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    match orch.run(request(), ctx).await {
        RenderState::Failed(RenderError::PlanFailed(msg)) => assert!(msg.contains("unexpected block layout")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn planning_timeout_fails_the_request() {
    let orch = Orchestrator::new(tasks(Hangs), engine(EngineMode::Succeed), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    let terminal = orch.run(request(), ctx).await;
    assert_eq!(terminal, RenderState::Failed(RenderError::PlanningTimeout(Duration::from_secs(5))));
}

#[tokio::test(start_paused = true)]
async fn planning_timeout_kills_the_unit() {
    let exec = Recording::default();
    let orch = Orchestrator::new(Arc::new(exec.clone()), engine(EngineMode::Succeed), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    let terminal = orch.run(request(), ctx).await;
    assert!(matches!(terminal, RenderState::Failed(RenderError::PlanningTimeout(_))));
    assert!(exec.killed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn crashed_unit_is_distinct_failure() {
    let exec = Recording { crash: true, ..Default::default() };
    let orch = Orchestrator::new(Arc::new(exec), engine(EngineMode::Succeed), config());
    let (job, ctx) = Job::new(Path::new("/tmp/renders"));
    match orch.run(request(), ctx).await {
        RenderState::Failed(e @ RenderError::ExecutorCrashed(_)) => assert!(e.to_string().contains("SIGKILL")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(job.to_status_response("http://h").error.unwrap().kind, "executor_crashed");
}

#[tokio::test]
async fn unstartable_executor_fails_cleanly() {
    let orch = Orchestrator::new(Arc::new(Unstartable), engine(EngineMode::Succeed), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    assert!(matches!(orch.run(request(), ctx).await, RenderState::Failed(RenderError::ExecutorCrashed(_))));
}

#[tokio::test]
async fn cancel_during_planning_kills_unit_and_stays_cancelled() {
    let exec = Recording::default();
    let eng = engine(EngineMode::Succeed);
    let orch = Arc::new(Orchestrator::new(Arc::new(exec.clone()), eng.clone(), config()));
    let store = JobStore::default();
    let (job, ctx) = Job::new(Path::new("/tmp/renders"));
    let id = store.insert(job).await;

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run(request(), ctx).await }
    });
    let mut state = store.get(&id).await.unwrap().state;
    state.wait_for(|s| *s == RenderState::Planning).await.unwrap();

    store.cancel(&id).await.unwrap();
    store.cancel(&id).await.unwrap();
    assert_eq!(run.await.unwrap(), RenderState::Cancelled);
    assert!(exec.killed.load(Ordering::SeqCst));
    assert!(eng.jobs.lock().unwrap().is_empty());

    store.cancel(&id).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().current_state(), RenderState::Cancelled);
}

#[tokio::test]
async fn cancel_before_start_never_spawns() {
    let exec = Recording::default();
    let orch = Orchestrator::new(Arc::new(exec.clone()), engine(EngineMode::Succeed), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    ctx.cancel.cancel();
    assert_eq!(orch.run(request(), ctx).await, RenderState::Cancelled);
    assert_eq!(exec.spawned.load(Ordering::SeqCst), 0);
}

async fn cancel_while_dispatched(mode: EngineMode) -> (RenderState, Arc<Engine>) {
    let eng = engine(mode);
    let orch = Arc::new(Orchestrator::new(tasks(Ready), eng.clone(), config()));
    let (job, ctx) = Job::new(Path::new("/tmp/renders"));
    let cancel = job.cancel.clone();

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run(request(), ctx).await }
    });
    let mut state = job.state.clone();
    state.wait_for(|s| *s == RenderState::Dispatched).await.unwrap();
    cancel.cancel();
    (run.await.unwrap(), eng)
}

#[tokio::test(start_paused = true)]
async fn cancel_during_dispatch_lets_engine_clean_up() {
    let (terminal, eng) = cancel_while_dispatched(EngineMode::StopOnCancel).await;
    assert_eq!(terminal, RenderState::Cancelled);
    assert!(eng.token.lock().unwrap().as_ref().unwrap().is_cancelled());
    assert!(eng.cleaned_up.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn engine_ignoring_cancel_is_dropped_after_grace() {
    let started = tokio::time::Instant::now();
    let (terminal, eng) = cancel_while_dispatched(EngineMode::Hang).await;
    assert_eq!(terminal, RenderState::Cancelled);
    assert!(eng.token.lock().unwrap().as_ref().unwrap().is_cancelled());
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(60), "{waited:?}");
}

#[tokio::test(start_paused = true)]
async fn render_timeout_cancels_engine() {
    let eng = engine(EngineMode::Hang);
    let orch = Orchestrator::new(tasks(Ready), eng.clone(), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    let terminal = orch.run(request(), ctx).await;
    assert_eq!(terminal, RenderState::Failed(RenderError::RenderTimeout(Duration::from_secs(60))));
    assert!(eng.token.lock().unwrap().as_ref().unwrap().is_cancelled());
}

#[tokio::test]
async fn engine_outcomes_are_propagated() {
    let orch = Orchestrator::new(tasks(Ready), engine(EngineMode::Fail), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    match orch.run(request(), ctx).await {
        RenderState::Failed(RenderError::RenderFailed(msg)) => assert!(msg.contains("encoder exploded")),
        other => panic!("unexpected {other:?}"),
    }

    let orch = Orchestrator::new(tasks(Ready), engine(EngineMode::SelfCancel), config());
    let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
    assert_eq!(orch.run(request(), ctx).await, RenderState::Cancelled);
}

#[tokio::test]
async fn concurrent_requests_get_their_own_units() {
    let exec = tasks(Ready);
    let eng = engine(EngineMode::Succeed);
    let orch = Arc::new(Orchestrator::new(exec, eng.clone(), config()));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let (_job, ctx) = Job::new(Path::new("/tmp/renders"));
        let orch = orch.clone();
        handles.push(tokio::spawn(async move { orch.run(request(), ctx).await }));
    }
    for h in handles {
        assert!(matches!(h.await.unwrap(), RenderState::Completed { .. }));
    }
    let jobs = eng.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 8);
    let mut dirs: Vec<_> = jobs.iter().map(|j| j.workdir.clone()).collect();
    dirs.sort();
    dirs.dedup();
    assert_eq!(dirs.len(), 8);
}
