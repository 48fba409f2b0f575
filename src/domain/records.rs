//! Import record domain types
//!
//! A record is one raw line/row of an import batch. It moves through rule
//! parsing, AI analysis and finally a one-way conversion into an event.
//! State changes are computed by pure functions on [`Record`]; stores only
//! persist what those functions decide.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rules::FieldKey;
use crate::error::{CollaboratorErrorKind, PipelineError};

// ============================================================================
// Status Enums
// ============================================================================

/// Record processing status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    /// An AI call for this record is in flight.
    Analyzing,
    Parsed,
    Converted,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Analyzing => "analyzing",
            ProcessingStatus::Parsed => "parsed",
            ProcessingStatus::Converted => "converted",
            ProcessingStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record conversion status (absent until the record is analyzed)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    Success,
    Failed,
    ManualReview,
}

impl std::fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionStatus::Pending => write!(f, "pending"),
            ConversionStatus::Success => write!(f, "success"),
            ConversionStatus::Failed => write!(f, "failed"),
            ConversionStatus::ManualReview => write!(f, "manual_review"),
        }
    }
}

/// Event/record priority
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Lenient label parsing for rule captures and AI payloads.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" | "minor" => Some(Priority::Low),
            "medium" | "normal" | "moderate" => Some(Priority::Medium),
            "high" | "important" => Some(Priority::High),
            "urgent" | "critical" | "asap" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

// ============================================================================
// Structured Sub-records
// ============================================================================

/// Candidate event fields, each unresolved until a rule or the AI sets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParsedFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub priority: Option<Priority>,
    pub category: Option<String>,
}

impl ParsedFields {
    /// Field precedence for AI enrichment: every field the AI resolved wins,
    /// rule-derived values only fill what the AI left empty.
    pub fn merge_ai_over_rules(rules: &ParsedFields, ai: &ParsedFields) -> ParsedFields {
        ParsedFields {
            title: ai.title.clone().or_else(|| rules.title.clone()),
            description: ai.description.clone().or_else(|| rules.description.clone()),
            start_at: ai.start_at.or(rules.start_at),
            end_at: ai.end_at.or(rules.end_at),
            location: ai.location.clone().or_else(|| rules.location.clone()),
            priority: ai.priority.or(rules.priority),
            category: ai.category.clone().or_else(|| rules.category.clone()),
        }
    }

    pub fn is_set(&self, key: FieldKey) -> bool {
        match key {
            FieldKey::Title => self.title.is_some(),
            FieldKey::Description => self.description.is_some(),
            FieldKey::StartAt => self.start_at.is_some(),
            FieldKey::EndAt => self.end_at.is_some(),
            FieldKey::Location => self.location.is_some(),
            FieldKey::Priority => self.priority.is_some(),
            FieldKey::Category => self.category.is_some(),
        }
    }

    /// Sets `key` from a raw string unless it already holds a value.
    /// Returns false when the field was taken or the value does not parse.
    pub fn set_if_absent(&mut self, key: FieldKey, raw: &str) -> bool {
        if self.is_set(key) {
            return false;
        }
        let raw = raw.trim();
        if raw.is_empty() {
            return false;
        }

        match key {
            FieldKey::Title => self.title = Some(raw.to_string()),
            FieldKey::Description => self.description = Some(raw.to_string()),
            FieldKey::Location => self.location = Some(raw.to_string()),
            FieldKey::Category => self.category = Some(raw.to_lowercase()),
            FieldKey::Priority => match Priority::from_label(raw) {
                Some(p) => self.priority = Some(p),
                None => return false,
            },
            FieldKey::StartAt => match parse_timestamp(raw) {
                Some(ts) => self.start_at = Some(ts),
                None => return false,
            },
            FieldKey::EndAt => match parse_timestamp(raw) {
                Some(ts) => self.end_at = Some(ts),
                None => return false,
            },
        }
        true
    }

    /// Title usable for an event: present and not blank.
    pub fn resolved_title(&self) -> Option<&str> {
        self.title.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Parses the timestamp shapes rules and spreadsheets commonly produce.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Result of one successful AI analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiAnalysisBlock {
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub category: Option<String>,
    pub importance: Option<Priority>,
    pub raw_payload: serde_json::Value,
    pub analyzed_at: DateTime<Utc>,
}

/// Error classification used in record and batch error logs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    BadResponse,
    RateLimited,
    Unknown,
    Storage,
}

impl From<CollaboratorErrorKind> for ErrorKind {
    fn from(kind: CollaboratorErrorKind) -> Self {
        match kind {
            CollaboratorErrorKind::Timeout => ErrorKind::Timeout,
            CollaboratorErrorKind::BadResponse => ErrorKind::BadResponse,
            CollaboratorErrorKind::RateLimited => ErrorKind::RateLimited,
            CollaboratorErrorKind::Unknown => ErrorKind::Unknown,
        }
    }
}

/// Entry in a record's append-only error list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RecordError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            at,
        }
    }

    /// Classifies a pipeline error for the record log.
    pub fn from_pipeline(err: &PipelineError, at: DateTime<Utc>) -> Self {
        let kind = match err {
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Collaborator(c) => c.kind.into(),
            PipelineError::Storage(_) => ErrorKind::Storage,
            PipelineError::Conflict(_) | PipelineError::NotFound(_) => ErrorKind::Unknown,
        };
        Self::new(kind, err.to_string(), at)
    }
}

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub row_number: i32,
    pub raw_text: String,
    /// Columns as they arrived, for columnar sources
    pub original_fields: Option<serde_json::Value>,
    pub parsed: ParsedFields,
    pub detected_keywords: Vec<String>,
    pub matched_rule_ids: Vec<Uuid>,
    pub ai_analysis: Option<AiAnalysisBlock>,
    pub processing_status: ProcessingStatus,
    pub conversion_status: Option<ConversionStatus>,
    /// Set exactly once, by conversion
    pub converted_event_id: Option<Uuid>,
    /// Advisory only; never blocks conversion
    pub manual_review_required: bool,
    pub manual_review_notes: Option<String>,
    pub parsing_errors: Vec<RecordError>,
    pub retry_count: i32,
    pub analysis_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one claimed analysis attempt, fed to [`Record::apply_analysis`].
#[derive(Debug, Clone)]
pub enum AnalysisEvent {
    /// Input was unusable; no AI call was made.
    Rejected { message: String },
    Analyzed {
        rule_fields: ParsedFields,
        ai_fields: ParsedFields,
        keywords: Vec<String>,
        matched_rule_ids: Vec<Uuid>,
        analysis: AiAnalysisBlock,
        review_threshold: f64,
    },
    AttemptFailed {
        error: RecordError,
        /// Status to return to while retry budget remains
        resume_status: ProcessingStatus,
        max_attempts: u32,
    },
}

impl Record {
    pub fn new(batch_id: Uuid, row_number: i32, raw_text: String, original_fields: Option<serde_json::Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            row_number,
            raw_text,
            original_fields,
            parsed: ParsedFields::default(),
            detected_keywords: Vec::new(),
            matched_rule_ids: Vec::new(),
            ai_analysis: None,
            processing_status: ProcessingStatus::Pending,
            conversion_status: None,
            converted_event_id: None,
            manual_review_required: false,
            manual_review_notes: None,
            parsing_errors: Vec::new(),
            retry_count: 0,
            analysis_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn ai_confidence(&self) -> Option<f64> {
        self.ai_analysis.as_ref().map(|a| a.confidence)
    }

    pub fn is_converted(&self) -> bool {
        self.converted_event_id.is_some() || self.processing_status == ProcessingStatus::Converted
    }

    /// Reprocessing is only possible before conversion.
    pub fn can_reprocess(&self) -> bool {
        !self.is_converted()
    }

    /// Computes the record state after an analysis attempt on a claimed record.
    pub fn apply_analysis(&self, event: AnalysisEvent, now: DateTime<Utc>) -> Record {
        let mut next = self.clone();
        next.analysis_started_at = None;
        next.updated_at = now;

        match event {
            AnalysisEvent::Rejected { message } => {
                next.processing_status = ProcessingStatus::Failed;
                next.manual_review_required = true;
                next.parsing_errors
                    .push(RecordError::new(ErrorKind::Validation, message, now));
            }
            AnalysisEvent::Analyzed {
                rule_fields,
                ai_fields,
                keywords,
                matched_rule_ids,
                analysis,
                review_threshold,
            } => {
                let mut merged = ParsedFields::merge_ai_over_rules(&rule_fields, &ai_fields);
                if ai_fields.category.is_none() && analysis.category.is_some() {
                    merged.category = analysis.category.clone();
                }
                if ai_fields.priority.is_none() && analysis.importance.is_some() {
                    merged.priority = analysis.importance;
                }

                if analysis.confidence < review_threshold {
                    next.manual_review_required = true;
                }
                next.parsed = merged;
                next.detected_keywords = keywords;
                next.matched_rule_ids = matched_rule_ids;
                next.ai_analysis = Some(analysis);
                next.processing_status = ProcessingStatus::Parsed;
                next.conversion_status = Some(ConversionStatus::Pending);
            }
            AnalysisEvent::AttemptFailed {
                error,
                resume_status,
                max_attempts,
            } => {
                next.retry_count += 1;
                next.parsing_errors.push(error);
                next.processing_status = if next.retry_count as u32 >= max_attempts.max(1) {
                    ProcessingStatus::Failed
                } else {
                    resume_status
                };
            }
        }

        next
    }
}

/// Manual review edit applied by an operator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordReviewInput {
    pub manual_review_required: Option<bool>,
    pub notes: Option<String>,
    /// Corrected values; set fields replace the current parsed value.
    pub corrections: Option<ParsedFields>,
}

impl Record {
    pub fn apply_review(&self, input: &RecordReviewInput, now: DateTime<Utc>) -> Record {
        let mut next = self.clone();
        if let Some(flag) = input.manual_review_required {
            next.manual_review_required = flag;
        }
        if let Some(notes) = &input.notes {
            next.manual_review_notes = Some(notes.clone());
        }
        if let Some(corrections) = &input.corrections {
            next.parsed = ParsedFields::merge_ai_over_rules(&next.parsed, corrections);
        }
        next.updated_at = now;
        next
    }
}
