use crate::error::EngineError;
use crate::types::{CompositionConfig, MediaKind, Plan, RenderProps, VideoInput};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the rendering engine gets for one request.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub workdir: PathBuf,
    pub composition_config: CompositionConfig,
    pub plan: Plan,
    pub props: RenderProps,
    pub input: VideoInput,
}

/// The external renderer. Must honor `cancel` and publish 0..=100 on `progress`.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn render(&self, job: RenderJob, cancel: CancellationToken, progress: &watch::Sender<u32>) -> Result<PathBuf, EngineError>;
}

#[derive(Clone, Debug)]
pub struct BackendCaps {
    pub nvenc: bool,
}

pub async fn detect_caps(ffmpeg: &Path) -> BackendCaps {
    let output = Command::new(ffmpeg).arg("-hide_banner").arg("-encoders").output().await;
    let nvenc = output.ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.contains("h264_nvenc"))
        .unwrap_or(false);
    BackendCaps { nvenc }
}

pub struct BuiltCommand {
    pub args: Vec<String>,
    pub output: PathBuf,
}

/// Background canvas at the composition size, with audio assets laid at their segment start.
pub fn build_ffmpeg_command(job: &RenderJob, caps: &BackendCaps) -> Result<BuiltCommand, EngineError> {
    let cfg = &job.composition_config;
    if cfg.duration_in_frames == 0 || cfg.fps == 0 {
        return Err(EngineError::Failed("composition has no frames".into()));
    }
    let out_path = job.workdir.join("output.mp4");
    let total_secs = cfg.duration_in_frames as f64 / cfg.fps as f64;
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into(), "-loglevel".into(), "error".into(), "-nostats".into()];

    args.extend(["-f".into(), "lavfi".into(), "-i".into(), format!("color=c=black:s={}x{}:r={}", cfg.width, cfg.height, cfg.fps)]);

    // One input per distinct audio file, delayed to where its block starts
    let mut seen = HashSet::new();
    let mut filter_parts: Vec<String> = Vec::new();
    let mut audio_labels: Vec<String> = Vec::new();
    for asset in job.plan.assets.iter().filter(|a| a.media == MediaKind::Audio) {
        if !seen.insert((asset.block_index, asset.path.clone())) {
            continue;
        }
        let idx = audio_labels.len() + 1;
        let start = job.plan.segments.get(asset.block_index).map_or(0.0, |s| s.start_secs);
        let delay_ms = (start * 1000.0).round() as u64;
        args.extend(["-i".into(), asset.path.to_string_lossy().to_string()]);
        let alabel = format!("a{}", idx);
        filter_parts.push(format!("[{}:a]adelay={}:all=1[{}]", idx, delay_ms, alabel));
        audio_labels.push(alabel);
    }

    if !audio_labels.is_empty() {
        if audio_labels.len() == 1 {
            filter_parts.push(format!("[{}]anull[aout]", audio_labels[0]));
        } else {
            let list = audio_labels.iter().map(|l| format!("[{}]", l)).collect::<String>();
            filter_parts.push(format!("{}amix=inputs={}:normalize=0[aout]", list, audio_labels.len()));
        }
        args.extend(["-filter_complex".into(), filter_parts.join(";")]);
    }

    args.extend(["-map".into(), "0:v".into()]);
    if caps.nvenc { args.extend(["-c:v".into(), "h264_nvenc".into(), "-preset".into(), "p4".into()]); }
    else { args.extend(["-c:v".into(), "libx264".into(), "-preset".into(), "veryfast".into()]); }
    args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    if !audio_labels.is_empty() {
        args.extend(["-map".into(), "[aout]".into(), "-c:a".into(), "aac".into(), "-b:a".into(), "192k".into()]);
    }
    args.extend(["-frames:v".into(), cfg.duration_in_frames.to_string(), "-t".into(), format!("{}", total_secs)]);
    args.extend(["-progress".into(), "pipe:1".into()]);
    args.push(out_path.to_string_lossy().to_string());

    Ok(BuiltCommand { args, output: out_path })
}

fn tail(s: &str, lines: usize) -> String {
    let all: Vec<&str> = s.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    caps: BackendCaps,
}

impl FfmpegEngine {
    pub fn new(ffmpeg: PathBuf, caps: BackendCaps) -> Self {
        Self { ffmpeg, caps }
    }

    pub async fn detect(ffmpeg: PathBuf) -> Self {
        let caps = detect_caps(&ffmpeg).await;
        info!(?caps, ffmpeg = %ffmpeg.display(), "Detected backend capabilities");
        Self::new(ffmpeg, caps)
    }
}

#[async_trait]
impl RenderEngine for FfmpegEngine {
    async fn render(&self, job: RenderJob, cancel: CancellationToken, progress: &watch::Sender<u32>) -> Result<PathBuf, EngineError> {
        tokio::fs::create_dir_all(&job.workdir).await?;
        let built = build_ffmpeg_command(&job, &self.caps)?;
        debug!(args = ?built.args, "spawning ffmpeg");

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&built.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Failed("ffmpeg stdout unavailable".into()))?;
        let stderr = child.stderr.take().ok_or_else(|| EngineError::Failed("ffmpeg stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut s = String::new();
            if let Err(e) = BufReader::new(stderr).read_to_string(&mut s).await {
                debug!(error = %e, "could not read ffmpeg stderr");
            }
            s
        });

        let total = job.composition_config.duration_in_frames.max(1) as f64;
        let outcome = {
            let run = async {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Some(val) = line.strip_prefix("frame=") {
                        if let Ok(frame) = val.trim().parse::<u64>() {
                            let pct = ((frame as f64 / total) * 100.0).min(100.0) as u32;
                            progress.send_replace(pct);
                        }
                    }
                }
                child.wait().await
            };
            tokio::select! {
                status = run => Some(status),
                _ = cancel.cancelled() => None,
            }
        };

        let status = match outcome {
            Some(status) => status?,
            None => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "ffmpeg already exited");
                }
                stderr_task.abort();
                info!(workdir = %job.workdir.display(), "ffmpeg cancelled");
                return Err(EngineError::Cancelled);
            }
        };
        let stderr = stderr_task.await.unwrap_or_default();
        if status.success() {
            progress.send_replace(100);
            Ok(built.output)
        } else {
            warn!(%status, stderr = %tail(&stderr, 5), "ffmpeg failed");
            Err(EngineError::Failed(format!("ffmpeg exit status: {}: {}", status, tail(&stderr, 20))))
        }
    }
}
