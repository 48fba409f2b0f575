//! AI collaborator interfaces
//!
//! The pipeline only knows these traits. Every call goes through
//! [`call_with_timeout`], which turns slow calls and panics into ordinary
//! [`CollaboratorError`]s so in-flight states are always left.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use crate::domain::{ParsedFields, Priority, SchedulePreferences, TaskInput};
use crate::error::CollaboratorError;

// ============================================================================
// Text analysis
// ============================================================================

/// What the pipeline already knows about a record when asking the AI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisContext {
    pub profession: Option<String>,
    /// Rule-derived fields
    pub hints: ParsedFields,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextAnalysis {
    pub fields: ParsedFields,
    pub confidence: f64,
    pub category: Option<String>,
    pub importance: Option<Priority>,
    pub raw_payload: serde_json::Value,
}

impl TextAnalysis {
    /// Rejects confidence scores outside `0.0..=1.0`.
    pub fn validate(self) -> Result<Self, CollaboratorError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CollaboratorError::bad_response(format!(
                "confidence {} outside 0..1",
                self.confidence
            )));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    async fn analyze(&self, text: &str, context: &AnalysisContext) -> Result<TextAnalysis, CollaboratorError>;
}

// ============================================================================
// Schedule optimization
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationRequest {
    pub tasks: Vec<TaskInput>,
    pub preferences: SchedulePreferences,
    pub target_date: NaiveDate,
}

/// One task placement proposed by the optimizer, on the target date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedSlot {
    pub task_id: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub suitability_score: Option<f64>,
    #[serde(default)]
    pub is_flexible: bool,
    pub reminder_minutes_before: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationPlan {
    pub slots: Vec<PlannedSlot>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    /// Tasks the optimizer reports it could not place
    #[serde(default)]
    pub unplaced_task_ids: Vec<String>,
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

#[async_trait]
pub trait ScheduleOptimizerAi: Send + Sync {
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationPlan, CollaboratorError>;
}

// ============================================================================
// Call boundary
// ============================================================================

/// Runs a collaborator call with a deadline. Timeouts and panics come back as
/// `timeout` and `unknown` errors respectively.
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(CollaboratorError::unknown("collaborator call panicked")),
        Err(_elapsed) => Err(CollaboratorError::timeout(timeout)),
    }
}
