use crate::composition;
use crate::durations;
use crate::types::{ContentBlock, MediaKind, Plan, PlannedSegment, ResolvedAsset, VideoInput, VideoMeta};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{collections::HashMap, path::PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

/// Produces the render-ready plan for a composition. May be slow and may fail.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, meta: &VideoMeta, blocks: &[Value]) -> Result<Plan>;
}

/// A `*src` field inside a block that points at remote media.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub field: String,
    pub url: Url,
    pub media: MediaKind,
}

fn media_kind(key: &str, block_kind: &str) -> MediaKind {
    let key = key.to_ascii_lowercase();
    if key.contains("audio") {
        MediaKind::Audio
    } else if key.contains("video") || (key == "src" && block_kind == "video") {
        MediaKind::Video
    } else {
        MediaKind::Image
    }
}

fn collect_refs(value: &Value, path: &str, block_kind: &str, out: &mut Vec<MediaRef>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                let field = if path.is_empty() { key.clone() } else { format!("{path}.{key}") };
                if let Value::String(s) = v {
                    if !key.to_ascii_lowercase().ends_with("src") {
                        continue;
                    }
                    match Url::parse(s) {
                        Ok(url) if matches!(url.scheme(), "http" | "https") => {
                            out.push(MediaRef { media: media_kind(key, block_kind), field, url })
                        }
                        _ => {}
                    }
                } else {
                    collect_refs(v, &field, block_kind, out);
                }
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect_refs(v, &format!("{path}[{i}]"), block_kind, out);
            }
        }
        _ => {}
    }
}

/// All remote media referenced by one raw block, in document order of its keys.
pub fn media_refs(block: &Value) -> Vec<MediaRef> {
    let kind = ContentBlock::from_value(block);
    let mut out = Vec::new();
    collect_refs(block, "", kind.kind(), &mut out);
    out
}

/// Back-to-back segments for every block, starting after the intro.
pub fn segments(meta: &VideoMeta, blocks: &[Value]) -> Vec<PlannedSegment> {
    let input = VideoInput { video_meta: meta.clone(), content_blocks: Vec::new() };
    let mut start = composition::intro_secs(&input);
    blocks
        .iter()
        .enumerate()
        .map(|(index, raw)| {
            let block = ContentBlock::from_value(raw);
            let duration_secs = durations::estimate(&block);
            let seg = PlannedSegment { index, kind: block.kind().to_string(), start_secs: start, duration_secs };
            start += duration_secs;
            seg
        })
        .collect()
}

/// Default generator: downloads every referenced remote asset into a shared cache dir.
pub struct AssetPlanGenerator {
    client: reqwest::Client,
    asset_dir: PathBuf,
    max_asset_bytes: u64,
}

impl AssetPlanGenerator {
    pub fn new(asset_dir: PathBuf, max_asset_bytes: u64) -> Self {
        Self { client: reqwest::Client::new(), asset_dir, max_asset_bytes }
    }

    fn cache_path(&self, url: &Url) -> PathBuf {
        let digest = hex::encode(Sha256::digest(url.as_str().as_bytes()));
        let filename = url
            .path_segments()
            .and_then(|mut s| s.next_back().map(|x| x.to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "asset.bin".to_string());
        let filename: String = filename
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
            .collect();
        self.asset_dir.join(format!("{}-{}", &digest[..16], filename))
    }

    async fn fetch(&self, url: &Url) -> Result<PathBuf> {
        let path = self.cache_path(url);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(%url, path = %path.display(), "asset cache hit");
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.asset_dir)
            .await
            .with_context(|| format!("creating asset dir {}", self.asset_dir.display()))?;

        let resp = self.client.get(url.clone()).send().await.with_context(|| format!("download request failed for {url}"))?;
        if !resp.status().is_success() {
            bail!("download of {url} returned {}", resp.status());
        }

        // Stream into a temp file next to the target, then rename into place.
        let tmp = tempfile::Builder::new().prefix(".part-").tempfile_in(&self.asset_dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);
        let bytes_stream = resp.bytes_stream();
        futures_util::pin_mut!(bytes_stream);
        let mut written = 0u64;
        while let Some(chunk) = bytes_stream.next().await {
            let b = chunk.with_context(|| format!("reading body of {url}"))?;
            written += b.len() as u64;
            if written > self.max_asset_bytes {
                bail!("asset {url} exceeds {} bytes", self.max_asset_bytes);
            }
            file.write_all(&b).await?;
        }
        file.flush().await?;
        drop(file);
        tmp.persist(&path).map_err(|e| e.error).with_context(|| format!("storing {}", path.display()))?;
        info!(%url, bytes = written, path = %path.display(), "downloaded asset");
        Ok(path)
    }
}

#[async_trait]
impl PlanGenerator for AssetPlanGenerator {
    async fn generate(&self, meta: &VideoMeta, blocks: &[Value]) -> Result<Plan> {
        let segments = segments(meta, blocks);
        let mut fetched: HashMap<Url, PathBuf> = HashMap::new();
        let mut assets = Vec::new();
        for (block_index, block) in blocks.iter().enumerate() {
            for r in media_refs(block) {
                let path = match fetched.get(&r.url) {
                    Some(p) => p.clone(),
                    None => {
                        let p = self.fetch(&r.url).await?;
                        fetched.insert(r.url.clone(), p.clone());
                        p
                    }
                };
                assets.push(ResolvedAsset {
                    block_index,
                    field: r.field,
                    url: r.url.to_string(),
                    path,
                    media: r.media,
                });
            }
        }
        debug!(segments = segments.len(), assets = assets.len(), unique = fetched.len(), "plan generated");
        Ok(Plan { segments, assets })
    }
}
