use crate::composition::CompositionLimits;
use crate::orchestrator::OrchestratorConfig;
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// One child process per request.
    Process,
    /// One tokio task per request, same process.
    Task,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown executor {other:?}, expected process or task")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub workdir: PathBuf,
    pub asset_dir: PathBuf,
    pub planning_timeout: Duration,
    pub render_timeout: Duration,
    pub limits: CompositionLimits,
    pub executor: ExecutorKind,
    pub ffmpeg: PathBuf,
    pub job_ttl: Duration,
    pub max_asset_bytes: u64,
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(key, value = %raw, error = %e, "invalid setting, using default");
            default
        }),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let port: u16 = parse_or(&get, "RENDER_PORT", 6108);
        let base_url = get("RENDER_BASE_URL").unwrap_or_else(|| format!("http://127.0.0.1:{}", port));
        let workdir = get("RENDER_WORKDIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("render_jobs"));
        let asset_dir = get("RENDER_ASSET_DIR").map(PathBuf::from).unwrap_or_else(|| workdir.join("assets"));

        let mut limits = CompositionLimits::default();
        let max: f64 = parse_or(&get, "RENDER_MAX_DURATION_SECS", limits.max_duration_secs);
        if max.is_finite() && max > 0.0 {
            limits.max_duration_secs = max;
        } else {
            warn!(value = max, "RENDER_MAX_DURATION_SECS must be positive, using default");
        }

        let mut planning_timeout = Duration::from_secs(parse_or(&get, "RENDER_PLANNING_TIMEOUT_SECS", 30));
        if planning_timeout.is_zero() || planning_timeout.as_secs_f64() >= limits.max_duration_secs {
            let clamped = Duration::from_secs_f64(limits.max_duration_secs / 2.0);
            warn!(?planning_timeout, ?clamped, "planning timeout must be positive and below the duration cap");
            planning_timeout = clamped;
        }

        Self {
            port,
            base_url,
            workdir,
            asset_dir,
            planning_timeout,
            render_timeout: Duration::from_secs(parse_or(&get, "RENDER_TIMEOUT_SECS", 600)),
            limits,
            executor: parse_or(&get, "RENDER_EXECUTOR", ExecutorKind::Process),
            ffmpeg: get("RENDER_FFMPEG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("ffmpeg")),
            job_ttl: Duration::from_secs(parse_or(&get, "RENDER_JOB_TTL_SECS", 3600)),
            max_asset_bytes: parse_or(&get, "RENDER_MAX_ASSET_BYTES", 512 * 1024 * 1024),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            planning_timeout: self.planning_timeout,
            render_timeout: self.render_timeout,
            ..OrchestratorConfig::default()
        }
    }
}
