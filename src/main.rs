use axum::{routing::{get, post}, Json, Router, extract::{Path, State}, http::StatusCode};
use clap::{Parser, Subcommand};
use compose_renderer::{
    composition,
    config::{Config, ExecutorKind},
    ffmpeg::FfmpegEngine,
    jobs::{Job, JobStore},
    orchestrator::{Orchestrator, RenderState},
    plan::AssetPlanGenerator,
    types::{CompositionConfig, RenderRequest, StatusResponse, SubmitResponse, VideoInput},
    worker::{self, Executor, ProcessExecutor, TaskExecutor, WORKER_ARG},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, error};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    store: JobStore,
    orchestrator: Arc<Orchestrator>,
    config: Arc<Config>,
}

type ApiError = (StatusCode, String);

#[derive(Debug, Parser)]
#[command(name = "compose-renderer", version, about = "Composition planning and render service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Plan one composition: request JSON on stdin, response line on stdout.
    #[command(name = WORKER_ARG)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the worker protocol, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("RENDER_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = Config::from_env();

    if cli.command == Some(Command::Worker) {
        let generator = AssetPlanGenerator::new(config.asset_dir.clone(), config.max_asset_bytes);
        return worker::serve_stdio(&generator, &config.limits).await;
    }

    let executor: Arc<dyn Executor> = match config.executor {
        ExecutorKind::Process => Arc::new(ProcessExecutor::current_exe()?),
        ExecutorKind::Task => Arc::new(TaskExecutor::new(
            Arc::new(AssetPlanGenerator::new(config.asset_dir.clone(), config.max_asset_bytes)),
            config.limits,
        )),
    };
    let engine = Arc::new(FfmpegEngine::detect(config.ffmpeg.clone()).await);
    let orchestrator = Arc::new(Orchestrator::new(executor, engine, config.orchestrator()));
    tokio::fs::create_dir_all(&config.workdir).await?;

    let store = JobStore::default();
    let reaper = store.clone();
    let ttl = config.job_ttl;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            let pruned = reaper.prune(ttl).await;
            if pruned > 0 { info!(pruned, "pruned finished jobs"); }
        }
    });

    info!(executor = ?config.executor, planning_timeout = ?config.planning_timeout, max_duration = config.limits.max_duration_secs, "Starting renderer");
    let state = AppState { store: store.clone(), orchestrator, config: Arc::new(config.clone()) };

    let app = Router::new()
        .route("/render", post(submit_render))
        .route("/render/:id", get(get_status).delete(cancel_render))
        .route("/render/:id/output", get(get_output))
        .route("/composition", post(preview_composition))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "Renderer listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await { error!(error = %e, "failed to listen for shutdown signal"); }
            info!("shutting down, cancelling in-flight renders");
            store.cancel_all().await;
        })
        .await?;
    Ok(())
}

async fn submit_render(State(state): State<AppState>, Json(request): Json<RenderRequest>) -> Json<SubmitResponse> {
    let (job, ctx) = Job::new(&state.config.workdir);
    let job_id = state.store.insert(job).await;
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.run(request, ctx).await;
    });
    Json(SubmitResponse { job_id: job_id.to_string() })
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| (StatusCode::BAD_REQUEST, "invalid id".into()))
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StatusResponse>, ApiError> {
    let uid = parse_id(&id)?;
    match state.store.get(&uid).await {
        Some(job) => Ok(Json(job.to_status_response(&state.config.base_url))),
        None => Err((StatusCode::NOT_FOUND, "not found".into())),
    }
}

async fn cancel_render(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<StatusResponse>, ApiError> {
    let uid = parse_id(&id)?;
    match state.store.cancel(&uid).await {
        Some(job) => Ok(Json(job.to_status_response(&state.config.base_url))),
        None => Err((StatusCode::NOT_FOUND, "not found".into())),
    }
}

async fn get_output(State(state): State<AppState>, Path(id): Path<String>) -> Result<axum::response::Response, ApiError> {
    let uid = parse_id(&id)?;
    let job = state.store.get(&uid).await.ok_or((StatusCode::NOT_FOUND, "not found".to_string()))?;
    match job.current_state() {
        RenderState::Completed { output } => {
            let bytes = tokio::fs::read(&output).await.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            let mut resp = axum::response::Response::new(bytes.into());
            resp.headers_mut().insert(axum::http::header::CONTENT_TYPE, axum::http::HeaderValue::from_static("video/mp4"));
            Ok(resp)
        }
        _ => Err((StatusCode::BAD_REQUEST, "not ready".into())),
    }
}

async fn preview_composition(State(state): State<AppState>, Json(input): Json<VideoInput>) -> Result<Json<CompositionConfig>, ApiError> {
    let limits = state.config.limits;
    tokio::task::spawn_blocking(move || composition::compute(&input, &limits))
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
