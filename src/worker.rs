//! Planning worker units. The default executor re-runs this binary as `worker`.

use crate::composition::{self, CompositionLimits};
use crate::error::ExecutorFailure;
use crate::plan::PlanGenerator;
use crate::types::{PlanningRequest, PlanningResponse, RenderProps};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe, path::PathBuf, process::Stdio, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Argument that switches the binary into worker mode.
pub const WORKER_ARG: &str = "worker";

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The body of a unit. Never panics past this point and always yields a response.
pub async fn run_planning(
    request: PlanningRequest,
    generator: &dyn PlanGenerator,
    limits: &CompositionLimits,
) -> PlanningResponse {
    let PlanningRequest { input, title, subtitle } = request;
    let timing = composition::timing(&input, limits);
    let composition_config = composition::compute(&input, limits);
    debug!(
        blocks = input.content_blocks.len(),
        intro = timing.intro_secs,
        content = timing.content_secs,
        outro = timing.outro_secs,
        total = timing.total_secs,
        frames = composition_config.duration_in_frames,
        "composition computed"
    );

    let generated = AssertUnwindSafe(async {
        generator.generate(&input.video_meta, &input.content_blocks).await
    })
    .catch_unwind()
    .await;

    match generated {
        Ok(Ok(plan)) => {
            let props = RenderProps { input, plan: plan.clone(), title, subtitle };
            PlanningResponse::Succeeded { plan, composition_config, props }
        }
        Ok(Err(e)) => {
            warn!(error = %format!("{e:#}"), "plan generation failed");
            PlanningResponse::Failed { error: format!("{e:#}") }
        }
        Err(payload) => {
            let msg = panic_message(payload);
            warn!(error = %msg, "plan generator panicked");
            PlanningResponse::Failed { error: format!("plan generator panicked: {msg}") }
        }
    }
}

/// Worker-mode entry: read one request from `reader`, write one response line to `writer`.
pub async fn serve<R, W>(mut reader: R, mut writer: W, generator: &dyn PlanGenerator, limits: &CompositionLimits) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    let response = match reader.read_to_string(&mut raw).await {
        Ok(_) => match serde_json::from_str::<PlanningRequest>(&raw) {
            Ok(request) => run_planning(request, generator, limits).await,
            Err(e) => PlanningResponse::Failed { error: format!("invalid planning request: {e}") },
        },
        Err(e) => PlanningResponse::Failed { error: format!("reading planning request: {e}") },
    };
    let mut line = serde_json::to_vec(&response).context("encoding planning response")?;
    line.push(b'\n');
    writer.write_all(&line).await.context("writing planning response")?;
    writer.flush().await?;
    Ok(())
}

pub async fn serve_stdio(generator: &dyn PlanGenerator, limits: &CompositionLimits) -> anyhow::Result<()> {
    serve(tokio::io::stdin(), tokio::io::stdout(), generator, limits).await
}

/// Starts isolated worker units.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn spawn(&self, request: PlanningRequest) -> Result<Box<dyn WorkerUnit>, ExecutorFailure>;
}

/// One in-flight unit. Serves a single request.
#[async_trait]
pub trait WorkerUnit: Send {
    /// Waits for the unit's single response. Do not call again after it has returned.
    async fn response(&mut self) -> Result<PlanningResponse, ExecutorFailure>;
    /// Force-terminates the unit. Safe to call at any time, including after it finished.
    async fn kill(&mut self);
}

/// Runs every unit as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect(), envs: Vec::new() }
    }

    /// Extra environment for every child, on top of the inherited one.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Re-executes the running binary in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [WORKER_ARG]))
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn spawn(&self, request: PlanningRequest) -> Result<Box<dyn WorkerUnit>, ExecutorFailure> {
        let payload = serde_json::to_vec(&request).map_err(|e| ExecutorFailure::Protocol(e.to_string()))?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(ExecutorFailure::Spawn)?;
        debug!(pid = ?child.id(), program = %self.program.display(), "worker process started");

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "worker stdin closed early");
                }
            });
        }
        let stdout = child.stdout.take();
        Ok(Box::new(ProcessUnit { child, stdout }))
    }
}

struct ProcessUnit {
    child: Child,
    stdout: Option<ChildStdout>,
}

#[async_trait]
impl WorkerUnit for ProcessUnit {
    async fn response(&mut self) -> Result<PlanningResponse, ExecutorFailure> {
        let mut out = String::new();
        if let Some(mut stdout) = self.stdout.take() {
            stdout.read_to_string(&mut out).await.map_err(|e| ExecutorFailure::Protocol(e.to_string()))?;
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ExecutorFailure::Crashed { status: e.to_string() })?;
        match out.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => serde_json::from_str(line).map_err(|e| ExecutorFailure::Protocol(e.to_string())),
            None => Err(ExecutorFailure::Crashed { status: status.to_string() }),
        }
    }

    async fn kill(&mut self) {
        let pid = self.child.id();
        match self.child.kill().await {
            Ok(()) => info!(?pid, "worker process killed"),
            Err(e) => debug!(error = %e, "worker process already gone"),
        }
    }
}

/// Runs every unit as a tokio task in this process.
///
/// Panics and aborts are contained, but a unit stuck in a CPU loop cannot be
/// reclaimed; prefer [`ProcessExecutor`] outside tests and embedded use.
#[derive(Clone)]
pub struct TaskExecutor {
    generator: Arc<dyn PlanGenerator>,
    limits: CompositionLimits,
}

impl TaskExecutor {
    pub fn new(generator: Arc<dyn PlanGenerator>, limits: CompositionLimits) -> Self {
        Self { generator, limits }
    }
}

#[async_trait]
impl Executor for TaskExecutor {
    async fn spawn(&self, request: PlanningRequest) -> Result<Box<dyn WorkerUnit>, ExecutorFailure> {
        let generator = self.generator.clone();
        let limits = self.limits;
        let handle = tokio::spawn(async move { run_planning(request, generator.as_ref(), &limits).await });
        Ok(Box::new(TaskUnit { handle }))
    }
}

struct TaskUnit {
    handle: JoinHandle<PlanningResponse>,
}

#[async_trait]
impl WorkerUnit for TaskUnit {
    async fn response(&mut self) -> Result<PlanningResponse, ExecutorFailure> {
        match (&mut self.handle).await {
            Ok(r) => Ok(r),
            Err(e) if e.is_panic() => Err(ExecutorFailure::Crashed { status: "worker task panicked".into() }),
            Err(_) => Err(ExecutorFailure::Crashed { status: "worker task aborted".into() }),
        }
    }

    async fn kill(&mut self) {
        self.handle.abort();
    }
}
