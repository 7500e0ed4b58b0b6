use crate::durations;
use crate::types::{CompositionConfig, VideoInput};

pub const DEFAULT_INTRO_SECS: f64 = 2.0;
pub const DEFAULT_OUTRO_SECS: f64 = 2.0;

/// Bounds applied to the final composition duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositionLimits {
    /// Global cap, applied to both the override and the computed total.
    pub max_duration_secs: f64,
    /// Used when the computed total is not a positive finite number.
    pub fallback_duration_secs: f64,
}

impl Default for CompositionLimits {
    fn default() -> Self {
        Self { max_duration_secs: 120.0, fallback_duration_secs: 8.0 }
    }
}

/// Timing breakdown behind a [`CompositionConfig`], mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub intro_secs: f64,
    pub content_secs: f64,
    pub outro_secs: f64,
    pub override_secs: Option<f64>,
    pub total_secs: f64,
}

pub fn intro_secs(input: &VideoInput) -> f64 {
    input.video_meta.intro.as_ref().and_then(|s| s.duration).unwrap_or(DEFAULT_INTRO_SECS)
}

pub fn outro_secs(input: &VideoInput) -> f64 {
    input.video_meta.outro.as_ref().and_then(|s| s.duration).unwrap_or(DEFAULT_OUTRO_SECS)
}

pub fn timing(input: &VideoInput, limits: &CompositionLimits) -> Timing {
    let intro_secs = intro_secs(input);
    let outro_secs = outro_secs(input);
    let content_secs: f64 = input.blocks().map(|b| durations::estimate(&b)).sum();
    let total_auto = intro_secs + content_secs + outro_secs;

    let override_secs = input
        .video_meta
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| d.min(limits.max_duration_secs));
    let safe_auto = if total_auto.is_finite() && total_auto > 0.0 {
        total_auto.min(limits.max_duration_secs)
    } else {
        limits.fallback_duration_secs
    };

    Timing {
        intro_secs,
        content_secs,
        outro_secs,
        override_secs,
        total_secs: override_secs.unwrap_or(safe_auto),
    }
}

/// Final render parameters for one composition. Never fails.
pub fn compute(input: &VideoInput, limits: &CompositionLimits) -> CompositionConfig {
    let (width, height) = input.video_meta.aspect_ratio.dimensions();
    let fps = input.video_meta.fps;
    let timing = timing(input, limits);
    CompositionConfig {
        width,
        height,
        fps,
        duration_in_frames: (timing.total_secs * fps as f64).round() as u64,
    }
}
