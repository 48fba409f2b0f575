//! Calendar event domain types
//!
//! Events come from manual creation, record conversion or slot
//! materialization. Each carries its own AI re-analysis sub-state guarded by
//! a claim lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::records::{AiAnalysisBlock, Priority, Record};
use super::schedule::OptimizedScheduleSlot;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum EventSource {
    Manual,
    Import,
    Optimizer,
}

/// Event AI re-analysis status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum EventAiStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for EventAiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAiStatus::Pending => write!(f, "pending"),
            EventAiStatus::InProgress => write!(f, "in_progress"),
            EventAiStatus::Completed => write!(f, "completed"),
            EventAiStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub priority: Option<Priority>,
    pub category: Option<String>,
    pub source: EventSource,
    pub import_record_id: Option<Uuid>,
    pub schedule_slot_id: Option<Uuid>,
    pub ai_status: EventAiStatus,
    pub ai_locked: bool,
    /// Token of the analysis run holding the lock; cleared on finish or reset
    #[serde(default, skip_serializing)]
    pub ai_claim_id: Option<Uuid>,
    pub ai_analysis: Option<AiAnalysisBlock>,
    pub ai_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// An analysis may start only on an unlocked event that is pending or failed.
    pub fn can_claim_analysis(&self) -> bool {
        !self.ai_locked && matches!(self.ai_status, EventAiStatus::Pending | EventAiStatus::Failed)
    }

    /// Text submitted to the analyzer for re-analysis.
    pub fn analysis_text(&self) -> String {
        match &self.description {
            Some(desc) if !desc.trim().is_empty() => format!("{}\n{}", self.title, desc),
            _ => self.title.clone(),
        }
    }

    /// Completed analyses keep the lock until an explicit reset.
    pub fn analysis_completed(&self, analysis: AiAnalysisBlock, now: DateTime<Utc>) -> Event {
        let mut next = self.clone();
        if next.category.is_none() {
            next.category = analysis.category.clone();
        }
        if next.priority.is_none() {
            next.priority = analysis.importance;
        }
        next.ai_analysis = Some(analysis);
        next.ai_status = EventAiStatus::Completed;
        next.ai_claim_id = None;
        next.ai_error = None;
        next.updated_at = now;
        next
    }

    /// Failure releases the lock so the event can be picked up again.
    pub fn analysis_failed(&self, error: &str, now: DateTime<Utc>) -> Event {
        let mut next = self.clone();
        next.ai_status = EventAiStatus::Failed;
        next.ai_locked = false;
        next.ai_claim_id = None;
        next.ai_error = Some(error.to_string());
        next.updated_at = now;
        next
    }
}

/// Fields for a new event, before it gets an id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub priority: Option<Priority>,
    pub category: Option<String>,
}

impl NewEvent {
    /// Event fields sourced from a record's parsed/AI fields. Title is required.
    pub fn from_record(record: &Record) -> PipelineResult<NewEvent> {
        let title = record.parsed.resolved_title().ok_or_else(|| {
            PipelineError::Validation(format!("record {} has no resolvable title", record.id))
        })?;

        Ok(NewEvent {
            title: title.to_string(),
            description: record.parsed.description.clone(),
            start_at: record.parsed.start_at,
            end_at: record.parsed.end_at,
            location: record.parsed.location.clone(),
            priority: record.parsed.priority,
            category: record.parsed.category.clone(),
        })
    }

    pub fn from_slot(slot: &OptimizedScheduleSlot) -> NewEvent {
        NewEvent {
            title: slot.title.clone(),
            description: slot.description.clone(),
            start_at: Some(slot.start_at),
            end_at: Some(slot.end_at),
            location: None,
            priority: Some(slot.priority),
            category: slot.category.clone(),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.title.trim().is_empty() {
            return Err(PipelineError::Validation("title is required".into()));
        }
        if let (Some(start), Some(end)) = (self.start_at, self.end_at) {
            if end < start {
                return Err(PipelineError::Validation("end_at precedes start_at".into()));
            }
        }
        Ok(())
    }

    pub fn into_event(self, user_id: Uuid, source: EventSource, now: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            user_id,
            title: self.title,
            description: self.description,
            start_at: self.start_at,
            end_at: self.end_at,
            location: self.location,
            priority: self.priority,
            category: self.category,
            source,
            import_record_id: None,
            schedule_slot_id: None,
            ai_status: EventAiStatus::Pending,
            ai_locked: false,
            ai_claim_id: None,
            ai_analysis: None,
            ai_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
