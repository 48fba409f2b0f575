//! Record → Event conversion
//!
//! Conversion is a one-way gate. The store inserts the event and sets the
//! record's back-link in one step, conditional on the record not being
//! converted yet, so racing callers can never produce two events.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::analysis::refresh_batch;
use super::clock::Clock;
use crate::domain::{
    BatchErrorEntry, EventSource, ImportBatch, NewEvent, ProcessingStatus, Record, RecordError,
};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{ImportStore, RecordQuery, RuleStore};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConvertOptions {
    pub min_confidence: f64,
    /// Restricts conversion to these records
    pub record_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ConversionResult {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

pub struct ConversionEngine {
    imports: Arc<dyn ImportStore>,
    rules: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
}

impl ConversionEngine {
    pub fn new(imports: Arc<dyn ImportStore>, rules: Arc<dyn RuleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { imports, rules, clock }
    }

    #[instrument(skip(self, options), fields(batch_id = %batch_id, min_confidence = options.min_confidence))]
    pub async fn convert(&self, batch_id: Uuid, options: &ConvertOptions) -> PipelineResult<ConversionResult> {
        if !options.min_confidence.is_finite() || !(0.0..=1.0).contains(&options.min_confidence) {
            return Err(PipelineError::Validation("min_confidence must be within 0..1".into()));
        }

        let batch = self
            .imports
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;

        let records = self
            .imports
            .list_records(&RecordQuery {
                record_ids: options.record_ids.clone(),
                ..RecordQuery::batch(batch_id)
            })
            .await?;

        let mut result = ConversionResult::default();
        let mut errors = Vec::new();

        for record in records {
            if record.is_converted() {
                result.skipped += 1;
                continue;
            }
            if !is_eligible(&record, options.min_confidence) {
                continue;
            }

            result.attempted += 1;
            match self.convert_one(&batch, &record).await {
                Ok(Converted::Yes) => result.succeeded += 1,
                Ok(Converted::Skipped) => result.skipped += 1,
                Ok(Converted::Failed(entry)) => {
                    result.failed += 1;
                    errors.push(entry);
                }
                Err(e) => {
                    if let Err(log_err) = self.imports.append_batch_errors(batch_id, &errors).await {
                        tracing::error!(error = %log_err, "Failed to append conversion errors");
                    }
                    return Err(e);
                }
            }
        }

        self.imports.append_batch_errors(batch_id, &errors).await?;
        refresh_batch(self.imports.as_ref(), batch_id, self.clock.now()).await?;

        tracing::info!(
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "Conversion finished"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(record_id = %record.id))]
    async fn convert_one(&self, batch: &ImportBatch, record: &Record) -> PipelineResult<Converted> {
        let now = self.clock.now();

        let new_event = NewEvent::from_record(record).and_then(|new_event| {
            new_event.validate()?;
            Ok(new_event)
        });
        let new_event = match new_event {
            Ok(new_event) => new_event,
            Err(e) => {
                tracing::warn!(error = %e, "Record cannot become an event, flagged for review");
                self.imports
                    .flag_manual_review(record.id, &e.to_string(), now)
                    .await?;
                return Ok(Converted::Skipped);
            }
        };

        let mut event = new_event.into_event(batch.user_id, EventSource::Import, now);
        event.import_record_id = Some(record.id);

        match self.imports.convert_record(record.id, &event).await {
            Ok(true) => {
                tracing::info!(event_id = %event.id, "Record converted");
                if !record.matched_rule_ids.is_empty() {
                    if let Err(e) = self.rules.record_success(&record.matched_rule_ids).await {
                        tracing::warn!(error = %e, "Failed to record rule success");
                    }
                }
                Ok(Converted::Yes)
            }
            Ok(false) => {
                tracing::debug!("Record converted concurrently");
                Ok(Converted::Skipped)
            }
            Err(e) => {
                tracing::error!(error = %e, "Event creation failed");
                let err = PipelineError::from(e);
                let error = RecordError::from_pipeline(&err, now);
                self.imports.mark_conversion_failed(record.id, &error).await?;
                Ok(Converted::Failed(BatchErrorEntry::for_record(record, err.to_string(), now)))
            }
        }
    }
}

enum Converted {
    Yes,
    Skipped,
    Failed(BatchErrorEntry),
}

/// Analyzed, unconverted and confident enough. Missing confidence never passes.
fn is_eligible(record: &Record, min_confidence: f64) -> bool {
    record.processing_status == ProcessingStatus::Parsed
        && record.converted_event_id.is_none()
        && record.ai_confidence().map_or(false, |c| c >= min_confidence)
}
