//! Lifecycle of one render request.
//!
//! ```text
//! Received ─► Planning ─► Planned ─► Dispatched ─► Completed
//!    │           │           │           ├───────► Failed
//!    └───────────┴───────────┴───────────┴───────► Cancelled
//!                └─► Failed
//! ```
//!
//! Planning runs in a worker unit and is bounded by a timeout; cancellation
//! kills the unit. Dispatch is bounded by the render timeout and forwards
//! cancellation to the engine. Terminal states are sticky.

use crate::error::{EngineError, RenderError};
use crate::ffmpeg::{RenderEngine, RenderJob};
use crate::types::{CompositionConfig, Plan, PlanningRequest, PlanningResponse, RenderProps, RenderRequest, VideoInput};
use crate::worker::Executor;
use std::{path::PathBuf, sync::Arc, time::{Duration, Instant}};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderState {
    Received,
    Planning,
    Planned,
    Dispatched,
    Completed { output: PathBuf },
    Failed(RenderError),
    Cancelled,
}

impl RenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RenderState::Completed { .. } | RenderState::Failed(_) | RenderState::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RenderState::Received => "RECEIVED",
            RenderState::Planning => "PLANNING",
            RenderState::Planned => "PLANNED",
            RenderState::Dispatched => "DISPATCHED",
            RenderState::Completed { .. } => "COMPLETED",
            RenderState::Failed(_) => "FAILED",
            RenderState::Cancelled => "CANCELLED",
        }
    }

    pub fn can_advance_to(&self, next: &RenderState) -> bool {
        use RenderState::*;
        match (self, next) {
            (Received, Planning) => true,
            (Planning, Planned) | (Planning, Failed(_)) => true,
            (Planned, Dispatched) => true,
            (Dispatched, Completed { .. }) | (Dispatched, Failed(_)) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Per-request handles shared between the job registry and the orchestrator.
pub struct JobContext {
    pub id: Uuid,
    pub workdir: PathBuf,
    pub cancel: CancellationToken,
    pub state: watch::Sender<RenderState>,
    pub progress: watch::Sender<u32>,
}

impl JobContext {
    fn advance(&self, next: RenderState) {
        let id = self.id;
        self.state.send_if_modified(|cur| {
            if cur.can_advance_to(&next) {
                info!(%id, from = cur.label(), to = next.label(), "render state");
                *cur = next;
                true
            } else {
                warn!(%id, from = cur.label(), to = next.label(), "refusing render state transition");
                false
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub planning_timeout: Duration,
    pub render_timeout: Duration,
    /// How long a cancelled engine gets to report its own outcome.
    pub cancel_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { planning_timeout: Duration::from_secs(30), render_timeout: Duration::from_secs(600), cancel_grace: Duration::from_secs(5) }
    }
}

struct Planned {
    composition_config: CompositionConfig,
    plan: Plan,
    props: RenderProps,
}

pub struct Orchestrator {
    executor: Arc<dyn Executor>,
    engine: Arc<dyn RenderEngine>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn Executor>, engine: Arc<dyn RenderEngine>, config: OrchestratorConfig) -> Self {
        Self { executor, engine, config }
    }

    /// Drives the request to exactly one terminal state and returns it.
    pub async fn run(&self, request: RenderRequest, ctx: JobContext) -> RenderState {
        let started = Instant::now();
        info!(id = %ctx.id, blocks = request.input.content_blocks.len(), "render request received");
        let terminal = self.drive(request, &ctx).await;
        ctx.advance(terminal);
        let last = ctx.state.borrow().clone();
        match &last {
            RenderState::Failed(e) => {
                warn!(id = %ctx.id, kind = e.kind(), error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "render failed")
            }
            s => info!(id = %ctx.id, state = s.label(), elapsed_ms = started.elapsed().as_millis() as u64, "render finished"),
        }
        last
    }

    async fn drive(&self, request: RenderRequest, ctx: &JobContext) -> RenderState {
        if ctx.cancel.is_cancelled() {
            return RenderState::Cancelled;
        }
        let input = request.input.clone();
        ctx.advance(RenderState::Planning);
        let planned = match self.plan(request.into(), ctx).await {
            Ok(p) => p,
            Err(terminal) => return terminal,
        };
        ctx.advance(RenderState::Planned);
        if ctx.cancel.is_cancelled() {
            return RenderState::Cancelled;
        }
        ctx.advance(RenderState::Dispatched);
        self.dispatch(planned, input, ctx).await
    }

    async fn plan(&self, request: PlanningRequest, ctx: &JobContext) -> Result<Planned, RenderState> {
        let mut unit = self.executor.spawn(request).await.map_err(|e| {
            warn!(id = %ctx.id, error = %e, "could not start planning worker");
            RenderState::Failed(RenderError::ExecutorCrashed(e.to_string()))
        })?;

        let timeout = self.config.planning_timeout;
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            res = tokio::time::timeout(timeout, unit.response()) => Some(res),
        };

        match outcome {
            None => {
                unit.kill().await;
                Err(RenderState::Cancelled)
            }
            Some(Err(_elapsed)) => {
                unit.kill().await;
                Err(RenderState::Failed(RenderError::PlanningTimeout(timeout)))
            }
            Some(Ok(Err(failure))) => {
                unit.kill().await;
                Err(RenderState::Failed(RenderError::ExecutorCrashed(failure.to_string())))
            }
            Some(Ok(Ok(PlanningResponse::Failed { error }))) => Err(RenderState::Failed(RenderError::PlanFailed(error))),
            Some(Ok(Ok(PlanningResponse::Succeeded { plan, composition_config, props }))) => {
                info!(
                    id = %ctx.id,
                    width = composition_config.width,
                    height = composition_config.height,
                    fps = composition_config.fps,
                    frames = composition_config.duration_in_frames,
                    assets = plan.assets.len(),
                    "planning done"
                );
                Ok(Planned { composition_config, plan, props })
            }
        }
    }

    async fn dispatch(&self, planned: Planned, input: VideoInput, ctx: &JobContext) -> RenderState {
        let job = RenderJob {
            workdir: ctx.workdir.clone(),
            composition_config: planned.composition_config,
            plan: planned.plan,
            props: planned.props,
            input,
        };
        let engine_cancel = ctx.cancel.child_token();
        let timeout = self.config.render_timeout;
        let render = tokio::time::timeout(timeout, self.engine.render(job, engine_cancel.clone(), &ctx.progress));
        tokio::pin!(render);
        let finished = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            res = &mut render => Some(res),
        };

        let outcome = match finished {
            Some(res) => res,
            // engine_cancel is already cancelled through its parent; let the engine wind down
            None => match tokio::time::timeout(self.config.cancel_grace, &mut render).await {
                Ok(Ok(res)) => Ok(res),
                _ => {
                    warn!(id = %ctx.id, grace = ?self.config.cancel_grace, "engine did not stop after cancellation, dropping it");
                    return RenderState::Cancelled;
                }
            },
        };

        match outcome {
            Err(_elapsed) => {
                engine_cancel.cancel();
                RenderState::Failed(RenderError::RenderTimeout(timeout))
            }
            Ok(Ok(output)) => RenderState::Completed { output },
            Ok(Err(EngineError::Cancelled)) => RenderState::Cancelled,
            Ok(Err(e)) => RenderState::Failed(RenderError::RenderFailed(e.to_string())),
        }
    }
}
