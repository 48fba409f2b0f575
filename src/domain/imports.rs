//! Import batch domain types
//!
//! One upload/paste operation. A batch owns its records and tracks overall
//! progress derived from their states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::records::{ProcessingStatus, Record};

/// Import batch status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SourceKind {
    FileUpload,
    ManualText,
    Api,
}

/// Declared content format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum ImportFormat {
    Csv,
    Excel,
    Json,
    Text,
}

/// Entry in the batch error log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchErrorEntry {
    pub record_id: Option<Uuid>,
    pub row_number: Option<i32>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl BatchErrorEntry {
    pub fn for_record(record: &Record, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            record_id: Some(record.id),
            row_number: Some(record.row_number),
            message: message.into(),
            at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source_kind: SourceKind,
    pub format: ImportFormat,
    pub original_filename: Option<String>,
    pub byte_size: i64,
    /// Where the raw upload is kept (storage key), if anywhere
    pub content_ref: Option<String>,
    pub status: BatchStatus,
    pub total_found: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub error_log: Vec<BatchErrorEntry>,
    pub profession: Option<String>,
    pub profession_confidence: Option<f64>,
    pub format_confidence: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status record counts of one batch
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub pending: i32,
    pub analyzing: i32,
    pub parsed: i32,
    pub converted: i32,
    pub failed: i32,
}

impl BatchProgress {
    pub fn add(&mut self, status: ProcessingStatus, count: i32) {
        match status {
            ProcessingStatus::Pending => self.pending += count,
            ProcessingStatus::Analyzing => self.analyzing += count,
            ProcessingStatus::Parsed => self.parsed += count,
            ProcessingStatus::Converted => self.converted += count,
            ProcessingStatus::Failed => self.failed += count,
        }
    }

    pub fn count(&self, status: ProcessingStatus) -> i32 {
        match status {
            ProcessingStatus::Pending => self.pending,
            ProcessingStatus::Analyzing => self.analyzing,
            ProcessingStatus::Parsed => self.parsed,
            ProcessingStatus::Converted => self.converted,
            ProcessingStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> i32 {
        self.pending + self.analyzing + self.parsed + self.converted + self.failed
    }

    pub fn succeeded(&self) -> i32 {
        self.parsed + self.converted
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.analyzing == 0
    }
}

impl ImportBatch {
    /// Marks the batch as processing if nothing has touched it yet.
    pub fn start(&self, now: DateTime<Utc>) -> ImportBatch {
        let mut next = self.clone();
        if next.status == BatchStatus::Pending {
            next.status = BatchStatus::Processing;
            next.started_at = Some(now);
            next.updated_at = now;
        }
        next
    }

    /// Recomputes counters and settles the status from record progress.
    ///
    /// A processing batch becomes terminal once no record is pending or in
    /// flight: `failed` when nothing succeeded and something failed,
    /// `completed` otherwise. A terminal batch with unsettled records
    /// re-opens.
    pub fn with_progress(&self, progress: &BatchProgress, now: DateTime<Utc>) -> ImportBatch {
        let mut next = if self.status.is_terminal() && !progress.is_settled() {
            self.reopen(now)
        } else {
            self.clone()
        };
        next.succeeded = progress.succeeded();
        next.failed = progress.failed;
        next.updated_at = now;

        if next.status == BatchStatus::Processing && progress.is_settled() {
            next.status = if progress.succeeded() == 0 && progress.failed > 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            next.completed_at = Some(now);
        }
        next
    }

    /// Re-opens a terminal batch whose records went back into the pipeline.
    fn reopen(&self, now: DateTime<Utc>) -> ImportBatch {
        let mut next = self.clone();
        next.status = BatchStatus::Processing;
        next.completed_at = None;
        next.updated_at = now;
        next
    }
}

// ============================================================================
// Batch Creation
// ============================================================================

/// One raw row produced by the upstream format sniffing step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub text: String,
    pub fields: Option<serde_json::Value>,
}

/// Create batch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewImportBatch {
    pub source_kind: SourceKind,
    pub format: ImportFormat,
    pub original_filename: Option<String>,
    pub content_ref: Option<String>,
    /// Pasted/plain content; split into one record per non-empty line when
    /// `rows` is empty.
    pub raw_content: Option<String>,
    #[serde(default)]
    pub rows: Vec<RawRow>,
    pub profession: Option<String>,
    pub profession_confidence: Option<f64>,
    pub format_confidence: Option<f64>,
}

impl NewImportBatch {
    /// Builds the batch and its records; row numbers start at 1.
    pub fn build(self, user_id: Uuid, now: DateTime<Utc>) -> (ImportBatch, Vec<Record>) {
        let batch_id = Uuid::new_v4();

        let rows: Vec<RawRow> = if self.rows.is_empty() {
            self.raw_content
                .as_deref()
                .unwrap_or_default()
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| RawRow {
                    text: line.trim().to_string(),
                    fields: None,
                })
                .collect()
        } else {
            self.rows
        };

        let byte_size = match &self.raw_content {
            Some(content) => content.len() as i64,
            None => rows.iter().map(|r| r.text.len() as i64).sum(),
        };

        let records: Vec<Record> = rows
            .into_iter()
            .enumerate()
            .map(|(idx, row)| Record::new(batch_id, idx as i32 + 1, row.text, row.fields, now))
            .collect();

        let batch = ImportBatch {
            id: batch_id,
            user_id,
            source_kind: self.source_kind,
            format: self.format,
            original_filename: self.original_filename,
            byte_size,
            content_ref: self.content_ref,
            status: BatchStatus::Pending,
            total_found: records.len() as i32,
            succeeded: 0,
            failed: 0,
            error_log: Vec::new(),
            profession: self.profession.map(|p| p.trim().to_lowercase()),
            profession_confidence: self.profession_confidence,
            format_confidence: self.format_confidence,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        (batch, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(content: &str) -> NewImportBatch {
        NewImportBatch {
            source_kind: SourceKind::ManualText,
            format: ImportFormat::Text,
            original_filename: None,
            content_ref: None,
            raw_content: Some(content.to_string()),
            rows: vec![],
            profession: Some(" Business ".into()),
            profession_confidence: None,
            format_confidence: None,
        }
    }

    #[test]
    fn manual_text_splits_into_numbered_records() {
        let (batch, records) = manual("Team meeting 9am\n\n  Dentist 3pm  \n").build(Uuid::new_v4(), Utc::now());

        assert_eq!(batch.total_found, 2);
        assert_eq!(batch.byte_size, 34);
        assert_eq!(batch.profession.as_deref(), Some("business"));
        assert_eq!(records[1].row_number, 2);
        assert_eq!(records[1].raw_text, "Dentist 3pm");
        assert!(records.iter().all(|r| r.batch_id == batch.id));
    }

    #[test]
    fn batch_settles_completed_with_partial_failure() {
        let (batch, _) = manual("a\nb").build(Uuid::new_v4(), Utc::now());
        let started = batch.start(Utc::now());

        let mut progress = BatchProgress::default();
        progress.add(ProcessingStatus::Parsed, 1);
        progress.add(ProcessingStatus::Failed, 1);

        let settled = started.with_progress(&progress, Utc::now());
        assert_eq!(settled.status, BatchStatus::Completed);
        assert_eq!(settled.succeeded + settled.failed, settled.total_found);
    }

    #[test]
    fn batch_fails_only_with_zero_successes() {
        let (batch, _) = manual("a").build(Uuid::new_v4(), Utc::now());
        let mut progress = BatchProgress::default();
        progress.add(ProcessingStatus::Failed, 1);

        let settled = batch.start(Utc::now()).with_progress(&progress, Utc::now());
        assert_eq!(settled.status, BatchStatus::Failed);
        assert!(settled.completed_at.is_some());
    }

    #[test]
    fn batch_stays_processing_while_records_pending() {
        let (batch, _) = manual("a\nb").build(Uuid::new_v4(), Utc::now());
        let mut progress = BatchProgress::default();
        progress.add(ProcessingStatus::Parsed, 1);
        progress.add(ProcessingStatus::Pending, 1);

        let next = batch.start(Utc::now()).with_progress(&progress, Utc::now());
        assert_eq!(next.status, BatchStatus::Processing);
        assert_eq!(next.succeeded, 1);
    }

    #[test]
    fn terminal_batch_reopens_when_records_return_to_pending() {
        let (batch, _) = manual("a").build(Uuid::new_v4(), Utc::now());
        let mut failed = BatchProgress::default();
        failed.add(ProcessingStatus::Failed, 1);
        let settled = batch.start(Utc::now()).with_progress(&failed, Utc::now());
        assert_eq!(settled.status, BatchStatus::Failed);

        let mut retried = BatchProgress::default();
        retried.add(ProcessingStatus::Pending, 1);
        let reopened = settled.with_progress(&retried, Utc::now());
        assert_eq!(reopened.status, BatchStatus::Processing);
        assert!(reopened.completed_at.is_none());
        assert_eq!(reopened.failed, 0);
    }
}
