use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

pub const DEFAULT_FPS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Landscape,
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:5")]
    Feed,
}

impl AspectRatio {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "16:9" => Some(Self::Landscape),
            "9:16" => Some(Self::Portrait),
            "1:1" => Some(Self::Square),
            "4:5" => Some(Self::Feed),
            _ => None,
        }
    }

    /// Pixel `(width, height)` for this ratio.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Landscape => (1920, 1080),
            Self::Portrait => (1080, 1920),
            Self::Square => (1080, 1080),
            Self::Feed => (1080, 1350),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Global settings for one composition. Unknown fields are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMeta {
    #[serde(default, deserialize_with = "lenient::aspect_ratio")]
    pub aspect_ratio: AspectRatio,
    #[serde(default = "default_fps", deserialize_with = "lenient::fps")]
    pub fps: u32,
    #[serde(default, deserialize_with = "lenient::object", skip_serializing_if = "Option::is_none")]
    pub intro: Option<Segment>,
    #[serde(default, deserialize_with = "lenient::object", skip_serializing_if = "Option::is_none")]
    pub outro: Option<Segment>,
    /// User supplied total duration override, seconds.
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_fps() -> u32 { DEFAULT_FPS }

impl Default for VideoMeta {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::default(),
            fps: DEFAULT_FPS,
            intro: None,
            outro: None,
            duration: None,
            extra: Map::new(),
        }
    }
}

/// Typed view of one content block, holding only what timing needs.
///
/// Decoded from the raw block JSON with [`ContentBlock::from_value`]; anything
/// that is not one of the known shapes lands in [`ContentBlock::Other`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    WhatsappChat {
        #[serde(default, deserialize_with = "lenient::count")]
        messages: usize,
    },
    MotivationalImage {
        #[serde(default, deserialize_with = "lenient::text")]
        text: Option<String>,
        #[serde(default, deserialize_with = "lenient::text")]
        audio_src: Option<String>,
        #[serde(default, deserialize_with = "lenient::number")]
        duration: Option<f64>,
    },
    Code {
        #[serde(default, deserialize_with = "lenient::text")]
        code: Option<String>,
    },
    Timeline {
        #[serde(default, deserialize_with = "lenient::count")]
        events: usize,
    },
    List {
        #[serde(default, deserialize_with = "lenient::count")]
        items: usize,
    },
    Counter {
        #[serde(default, deserialize_with = "lenient::number")]
        duration: Option<f64>,
    },
    ProgressBar {},
    QrCode {},
    Video {
        #[serde(rename = "loop", default, deserialize_with = "lenient::flag")]
        looped: bool,
    },
    AvatarGrid {
        #[serde(default, deserialize_with = "lenient::count")]
        avatars: usize,
    },
    SocialStats {},
    Cta {},
    GradientText {
        #[serde(default, deserialize_with = "lenient::number")]
        animation_speed: Option<f64>,
    },
    AnimatedBg {},
    Countdown {},
    WeatherBlock {},
    #[serde(rename = "tower-chart-3d")]
    TowerChart3d {
        #[serde(default, deserialize_with = "lenient::count")]
        items: usize,
        #[serde(default, deserialize_with = "lenient::number")]
        camera_pause_duration: Option<f64>,
        #[serde(default, deserialize_with = "lenient::number")]
        camera_move_speed: Option<f64>,
    },
    #[serde(skip)]
    Other { kind: String },
}

impl ContentBlock {
    /// Total: never fails, falls back to [`ContentBlock::Other`].
    pub fn from_value(value: &Value) -> Self {
        match ContentBlock::deserialize(value) {
            Ok(block) => block,
            Err(_) => ContentBlock::Other {
                kind: value.get("type").and_then(Value::as_str).unwrap_or_default().to_owned(),
            },
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::WhatsappChat { .. } => "whatsapp-chat",
            Self::MotivationalImage { .. } => "motivational-image",
            Self::Code { .. } => "code",
            Self::Timeline { .. } => "timeline",
            Self::List { .. } => "list",
            Self::Counter { .. } => "counter",
            Self::ProgressBar {} => "progress-bar",
            Self::QrCode {} => "qr-code",
            Self::Video { .. } => "video",
            Self::AvatarGrid { .. } => "avatar-grid",
            Self::SocialStats {} => "social-stats",
            Self::Cta {} => "cta",
            Self::GradientText { .. } => "gradient-text",
            Self::AnimatedBg {} => "animated-bg",
            Self::Countdown {} => "countdown",
            Self::WeatherBlock {} => "weather-block",
            Self::TowerChart3d { .. } => "tower-chart-3d",
            Self::Other { kind } => kind,
        }
    }
}

/// One composition: metadata plus ordered content blocks (raw JSON, render order).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInput {
    #[serde(default, deserialize_with = "lenient::or_default")]
    pub video_meta: VideoMeta,
    #[serde(default, deserialize_with = "lenient::list")]
    pub content_blocks: Vec<Value>,
}

impl VideoInput {
    pub fn blocks(&self) -> impl Iterator<Item = ContentBlock> + '_ {
        self.content_blocks.iter().map(ContentBlock::from_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub duration_in_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind { Image, Audio, Video }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAsset {
    pub block_index: usize,
    pub field: String,
    pub url: String,
    pub path: PathBuf,
    pub media: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedSegment {
    pub index: usize,
    pub kind: String,
    pub start_secs: f64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub segments: Vec<PlannedSegment>,
    pub assets: Vec<ResolvedAsset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProps {
    pub input: VideoInput,
    pub plan: Plan,
    pub title: String,
    pub subtitle: String,
}

/// Inbound render request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(alias = "videoInput")]
    pub input: VideoInput,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
}

/// Sent to a worker unit. The only thing that crosses into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningRequest {
    pub input: VideoInput,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
}

impl From<RenderRequest> for PlanningRequest {
    fn from(r: RenderRequest) -> Self {
        Self { input: r.input, title: r.title, subtitle: r.subtitle }
    }
}

/// The single message a worker unit sends back.
///
/// On the wire this is `{"ok": true, "plan", "compositionConfig", "props"}` or
/// `{"ok": false, "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireResponse", into = "WireResponse")]
pub enum PlanningResponse {
    Succeeded {
        plan: Plan,
        composition_config: CompositionConfig,
        props: RenderProps,
    },
    Failed { error: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    composition_config: Option<CompositionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    props: Option<RenderProps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<WireResponse> for PlanningResponse {
    type Error = String;

    fn try_from(w: WireResponse) -> Result<Self, Self::Error> {
        if !w.ok {
            return Ok(Self::Failed { error: w.error.unwrap_or_else(|| "unknown planning error".into()) });
        }
        match (w.plan, w.composition_config, w.props) {
            (Some(plan), Some(composition_config), Some(props)) => {
                Ok(Self::Succeeded { plan, composition_config, props })
            }
            _ => Err("ok response is missing plan, compositionConfig or props".into()),
        }
    }
}

impl From<PlanningResponse> for WireResponse {
    fn from(r: PlanningResponse) -> Self {
        match r {
            PlanningResponse::Succeeded { plan, composition_config, props } => Self {
                ok: true,
                plan: Some(plan),
                composition_config: Some(composition_config),
                props: Some(props),
                error: None,
            },
            PlanningResponse::Failed { error } => Self {
                ok: false,
                plan: None,
                composition_config: None,
                props: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse { pub job_id: String }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub id: Uuid,
    pub status: String,
    pub progress: u32,
    pub url: Option<String>,
    pub error: Option<ErrorBody>,
}

/// Field decoders that fall back to defaults instead of rejecting the document.
mod lenient {
    use super::{AspectRatio, DEFAULT_FPS};
    use serde::{de::DeserializeOwned, Deserialize, Deserializer};
    use serde_json::Value;

    fn raw<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
        Option::<Value>::deserialize(d)
    }

    pub fn aspect_ratio<'de, D: Deserializer<'de>>(d: D) -> Result<AspectRatio, D::Error> {
        Ok(raw(d)?.as_ref().and_then(Value::as_str).and_then(AspectRatio::parse).unwrap_or_default())
    }

    pub fn fps<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(raw(d)?
            .as_ref()
            .and_then(Value::as_f64)
            .filter(|f| f.is_finite() && *f >= 1.0 && f.fract() == 0.0 && *f <= u32::MAX as f64)
            .map(|f| f as u32)
            .unwrap_or(DEFAULT_FPS))
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(raw(d)?.as_ref().and_then(Value::as_f64))
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(raw(d)?.as_ref().and_then(Value::as_str).map(str::to_owned))
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        Ok(raw(d)?.as_ref().and_then(Value::as_array).map_or(0, Vec::len))
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(raw(d)?.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Value>, D::Error> {
        Ok(match raw(d)? {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        })
    }

    pub fn object<'de, D: Deserializer<'de>, T: DeserializeOwned>(d: D) -> Result<Option<T>, D::Error> {
        Ok(raw(d)?.filter(Value::is_object).and_then(|v| serde_json::from_value(v).ok()))
    }

    pub fn or_default<'de, D: Deserializer<'de>, T: DeserializeOwned + Default>(d: D) -> Result<T, D::Error> {
        Ok(object(d)?.unwrap_or_default())
    }
}
