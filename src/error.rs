use crate::types::ErrorBody;
use std::time::Duration;
use thiserror::Error;

/// Why a worker unit failed to deliver a planning response.
#[derive(Error, Debug)]
pub enum ExecutorFailure {
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker exited without a response ({status})")]
    Crashed { status: String },

    #[error("worker sent an unreadable response: {0}")]
    Protocol(String),
}

/// Failure reported by the rendering engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("render cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal failure of one render request, as seen by the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("plan generation failed: {0}")]
    PlanFailed(String),

    #[error("planning worker crashed: {0}")]
    ExecutorCrashed(String),

    #[error("planning timed out after {0:?}")]
    PlanningTimeout(Duration),

    #[error("render failed: {0}")]
    RenderFailed(String),

    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),
}

impl RenderError {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::PlanFailed(_) => "plan_failed",
            RenderError::ExecutorCrashed(_) => "executor_crashed",
            RenderError::PlanningTimeout(_) => "planning_timeout",
            RenderError::RenderFailed(_) => "render_failed",
            RenderError::RenderTimeout(_) => "render_timeout",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody { kind: self.kind().to_string(), message: self.to_string() }
    }
}
