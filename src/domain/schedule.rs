//! Schedule optimization domain types
//!
//! An `AiScheduleAnalysis` is one optimization run for a user and date; it
//! owns the `OptimizedScheduleSlot` rows created when the run finishes.
//! Slot times are stored in UTC.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::records::Priority;

// ============================================================================
// Inputs
// ============================================================================

/// One task to place
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInput {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub duration_minutes: i32,
    pub priority: Priority,
    pub preferred_time: Option<NaiveTime>,
    pub category: Option<String>,
    /// Import record this task came from, if any
    pub source_record_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulePreferences {
    pub work_start: NaiveTime,
    pub work_end: NaiveTime,
    pub break_minutes: i32,
    #[serde(default)]
    pub excluded_slots: Vec<TimeRange>,
    /// Default reminder lead time for placed slots
    pub reminder_minutes_before: Option<i32>,
}

impl Default for SchedulePreferences {
    fn default() -> Self {
        Self {
            work_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            work_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            break_minutes: 15,
            excluded_slots: Vec::new(),
            reminder_minutes_before: None,
        }
    }
}

impl SchedulePreferences {
    /// Minutes inside the work window not covered by excluded slots.
    pub fn available_minutes(&self) -> i64 {
        if self.work_end <= self.work_start {
            return 0;
        }

        let mut excluded: Vec<(NaiveTime, NaiveTime)> = self
            .excluded_slots
            .iter()
            .map(|r| (r.start.max(self.work_start), r.end.min(self.work_end)))
            .filter(|(s, e)| s < e)
            .collect();
        excluded.sort();

        let mut blocked = 0i64;
        let mut cursor: Option<(NaiveTime, NaiveTime)> = None;
        for (start, end) in excluded {
            match cursor {
                Some((cs, ce)) if start <= ce => cursor = Some((cs, ce.max(end))),
                Some((cs, ce)) => {
                    blocked += (ce - cs).num_minutes();
                    cursor = Some((start, end));
                }
                None => cursor = Some((start, end)),
            }
        }
        if let Some((cs, ce)) = cursor {
            blocked += (ce - cs).num_minutes();
        }

        (self.work_end - self.work_start).num_minutes() - blocked
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Analysis status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// The AI reported some tasks as unplaced; placed slots were kept.
    Partial,
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisStatus::Pending => write!(f, "pending"),
            AnalysisStatus::Processing => write!(f, "processing"),
            AnalysisStatus::Completed => write!(f, "completed"),
            AnalysisStatus::Failed => write!(f, "failed"),
            AnalysisStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleMetrics {
    pub total_scheduled_minutes: i64,
    pub available_minutes: i64,
    pub utilization_rate: f64,
    /// Metrics as reported by the optimizer
    pub reported: serde_json::Value,
}

impl ScheduleMetrics {
    pub fn compute(total_scheduled_minutes: i64, available_minutes: i64, reported: serde_json::Value) -> Self {
        let utilization_rate = if available_minutes > 0 {
            total_scheduled_minutes as f64 / available_minutes as f64
        } else {
            0.0
        };
        Self {
            total_scheduled_minutes,
            available_minutes,
            utilization_rate,
            reported,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiScheduleAnalysis {
    pub id: Uuid,
    pub user_id: Uuid,
    pub target_date: NaiveDate,
    pub tasks: Vec<TaskInput>,
    pub preferences: SchedulePreferences,
    pub status: AnalysisStatus,
    pub ai_response: Option<serde_json::Value>,
    pub metrics: Option<ScheduleMetrics>,
    pub unplaced_task_ids: Vec<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    /// Analysis this one retries
    pub retried_from: Option<Uuid>,
    pub user_approved: Option<bool>,
    pub user_rating: Option<i16>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiScheduleAnalysis {
    pub fn new(
        user_id: Uuid,
        target_date: NaiveDate,
        tasks: Vec<TaskInput>,
        preferences: SchedulePreferences,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            target_date,
            tasks,
            preferences,
            status: AnalysisStatus::Pending,
            ai_response: None,
            metrics: None,
            unplaced_task_ids: Vec::new(),
            error: None,
            retry_count: 0,
            retried_from: None,
            user_approved: None,
            user_rating: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fresh pending analysis over the same snapshot; history is kept.
    pub fn retry(&self, now: DateTime<Utc>) -> Self {
        let mut next = Self::new(
            self.user_id,
            self.target_date,
            self.tasks.clone(),
            self.preferences.clone(),
            now,
        );
        next.retry_count = self.retry_count + 1;
        next.retried_from = Some(self.id);
        next
    }

    pub fn failed(&self, error: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = AnalysisStatus::Failed;
        next.error = Some(error.to_string());
        next.completed_at = Some(now);
        next.updated_at = now;
        next
    }

    pub fn finished(
        &self,
        response: serde_json::Value,
        metrics: ScheduleMetrics,
        unplaced_task_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.status = if unplaced_task_ids.is_empty() {
            AnalysisStatus::Completed
        } else {
            AnalysisStatus::Partial
        };
        next.ai_response = Some(response);
        next.metrics = Some(metrics);
        next.unplaced_task_ids = unplaced_task_ids;
        next.error = None;
        next.completed_at = Some(now);
        next.updated_at = now;
        next
    }
}

/// User approval and rating of an analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFeedback {
    pub approved: bool,
    pub rating: Option<i16>,
}

// ============================================================================
// Slots
// ============================================================================

/// Slot status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SlotStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Scheduled => write!(f, "scheduled"),
            SlotStatus::Completed => write!(f, "completed"),
            SlotStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedScheduleSlot {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub user_id: Uuid,
    pub date: NaiveDate,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub task_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub category: Option<String>,
    pub suitability_score: Option<f64>,
    pub is_flexible: bool,
    pub reminder_minutes_before: i32,
    pub notification_sent: bool,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub user_confirmed: bool,
    pub status: SlotStatus,
    pub source_record_id: Option<Uuid>,
    /// Event materialized from this slot; set at most once
    pub converted_event_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Analysis together with its slots
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    #[serde(flatten)]
    pub analysis: AiScheduleAnalysis,
    pub slots: Vec<OptimizedScheduleSlot>,
}
