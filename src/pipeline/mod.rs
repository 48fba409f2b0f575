//! Import and scheduling pipeline
//!
//! Engines orchestrate the stores and the AI collaborators. They hold no
//! state of their own; all coordination happens through conditional store
//! updates.

pub mod analysis;
pub mod clock;
pub mod collaborators;
pub mod conversion;
pub mod event_analysis;
pub mod optimizer;
pub mod parsing;
pub mod reminders;

use std::time::Duration;

use crate::config::Settings;

pub use analysis::{AnalysisPipeline, ProcessOptions};
pub use clock::{Clock, SystemClock};
pub use collaborators::{ScheduleOptimizerAi, TextAnalyzer};
pub use conversion::{ConversionEngine, ConvertOptions};
pub use event_analysis::EventAnalysis;
pub use optimizer::ScheduleOptimizer;
pub use reminders::{NotificationScheduler, ReminderSink};

/// Knobs shared by the engines
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Analyses below this confidence are flagged for manual review
    pub review_threshold: f64,
    /// Records analyzed in parallel within one batch call
    pub concurrency: usize,
    /// Age after which an `analyzing` claim is considered abandoned
    pub stale_after: chrono::Duration,
    pub ai_timeout: Duration,
    pub default_reminder_minutes: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.7,
            concurrency: 4,
            stale_after: chrono::Duration::minutes(10),
            ai_timeout: Duration::from_secs(120),
            default_reminder_minutes: 15,
        }
    }
}

impl From<&Settings> for PipelineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            review_threshold: settings.review_confidence_threshold,
            concurrency: settings.record_concurrency,
            stale_after: chrono::Duration::seconds(settings.analysis_stale_after_seconds),
            ai_timeout: Duration::from_secs(settings.ai_service_timeout_seconds),
            default_reminder_minutes: settings.default_reminder_minutes,
        }
    }
}
