use crate::types::ContentBlock;

pub const DEFAULT_BLOCK_SECS: f64 = 3.0;

const CHAT_CAP_SECS: f64 = 60.0;
const TOWER_CAP_SECS: f64 = 60.0;
const TOWER_PAUSE_SECS: f64 = 0.4;
const TOWER_MOVE_SECS: f64 = 0.8;

/// Per-message reveal delay for a chat with `n` messages.
fn chat_message_delay(n: usize) -> f64 {
    match n {
        0..=5 => 2.0,
        6..=15 => 1.5,
        16..=30 => 1.0,
        _ => 0.8,
    }
}

/// Length as the editor measures it (UTF-16 code units).
fn text_len(s: Option<&str>) -> f64 {
    s.map_or(0, |s| s.encode_utf16().count()) as f64
}

/// Explicit durations are honored only when usable.
fn explicit(v: Option<f64>) -> Option<f64> {
    v.filter(|d| d.is_finite() && *d >= 0.0)
}

pub fn estimate(block: &ContentBlock) -> f64 {
    match block {
        ContentBlock::WhatsappChat { messages } => {
            let n = *messages as f64;
            let intro = 0.5;
            let typing = 2.5;
            let outro = 1.5;
            (intro + typing + n * chat_message_delay(*messages) + outro).min(CHAT_CAP_SECS)
        }
        ContentBlock::MotivationalImage { text, audio_src, duration } => {
            if let Some(d) = explicit(*duration) {
                return d;
            }
            let len = text_len(text.as_deref());
            if audio_src.as_deref().is_some_and(|s| !s.is_empty()) {
                ((len / 20.0).ceil() + 3.0).max(5.0)
            } else {
                (4.0 + (len / 30.0).ceil()).min(10.0)
            }
        }
        ContentBlock::Code { code } => (text_len(code.as_deref()) / 100.0).ceil().min(8.0),
        ContentBlock::Timeline { events } => 4.0 + (*events as f64 * 0.5).ceil(),
        ContentBlock::List { items } => 3.0 + (*items as f64 * 0.5).ceil(),
        ContentBlock::Counter { duration } => explicit(*duration).unwrap_or(3.0),
        ContentBlock::ProgressBar {} => 3.0,
        ContentBlock::QrCode {} | ContentBlock::SocialStats {} | ContentBlock::Cta {} => 4.0,
        ContentBlock::Video { looped } => {
            if *looped { 10.0 } else { 5.0 }
        }
        ContentBlock::AvatarGrid { avatars } => 3.0 + (*avatars as f64 * 0.2).ceil(),
        ContentBlock::GradientText { animation_speed } => explicit(*animation_speed).unwrap_or(3.0),
        ContentBlock::AnimatedBg {} | ContentBlock::WeatherBlock {} => 5.0,
        ContentBlock::Countdown {} => 6.0,
        ContentBlock::TowerChart3d { items, camera_pause_duration, camera_move_speed } => {
            let pause = explicit(*camera_pause_duration).unwrap_or(TOWER_PAUSE_SECS);
            let travel = explicit(*camera_move_speed).unwrap_or(TOWER_MOVE_SECS);
            (1.5 + *items as f64 * (pause + travel) + 1.0).min(TOWER_CAP_SECS)
        }
        ContentBlock::Other { .. } => DEFAULT_BLOCK_SECS,
    }
}
