//! Composition timing and render orchestration service.

pub mod composition;
pub mod config;
pub mod durations;
pub mod error;
pub mod ffmpeg;
pub mod jobs;
pub mod orchestrator;
pub mod plan;
pub mod types;
pub mod worker;
