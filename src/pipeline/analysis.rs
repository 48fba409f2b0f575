//! AI analysis of import records
//!
//! Per record: claim (`analyzing`), rule pass, AI call under a deadline,
//! then one conditional write of the outcome. The claim is always released
//! by that write, whatever the AI call did.

use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::clock::Clock;
use super::collaborators::{call_with_timeout, AnalysisContext, TextAnalyzer};
use super::parsing::ParsingEngine;
use super::PipelineConfig;
use crate::domain::{
    AiAnalysisBlock, AnalysisEvent, BatchErrorEntry, BatchStatus, ImportBatch, ProcessingStatus, Record,
    RecordError, RecordReviewInput,
};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{ImportStore, RecordQuery, RuleStore};

/// Options for one `process_batch` call
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessOptions {
    /// Parsed records whose confidence is missing or below this are analyzed
    /// again. Without it, parsed records are left alone.
    pub min_confidence: Option<f64>,
    /// Maximum number of records to analyze in this call
    pub limit: Option<usize>,
    /// Attempts before a record is marked failed (default 1)
    pub max_attempts: Option<u32>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProcessingResult {
    /// Records claimed and analyzed in this call
    pub processed: u32,
    pub succeeded: u32,
    /// Records that ended `failed`
    pub failed: u32,
    /// Records whose attempt failed but still have retry budget left
    pub deferred: u32,
    /// Converted records, and records another operation held
    pub skipped: u32,
}

enum RecordOutcome {
    Succeeded,
    Failed(BatchErrorEntry),
    Deferred(BatchErrorEntry),
    Skipped,
}

struct Candidate {
    record: Record,
    expected: ProcessingStatus,
}

pub struct AnalysisPipeline {
    imports: Arc<dyn ImportStore>,
    rules: Arc<dyn RuleStore>,
    analyzer: Arc<dyn TextAnalyzer>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl AnalysisPipeline {
    pub fn new(
        imports: Arc<dyn ImportStore>,
        rules: Arc<dyn RuleStore>,
        analyzer: Arc<dyn TextAnalyzer>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            imports,
            rules,
            analyzer,
            clock,
            config,
        }
    }

    async fn load_batch(&self, batch_id: Uuid) -> PipelineResult<ImportBatch> {
        self.imports
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))
    }

    #[instrument(skip(self, options), fields(batch_id = %batch_id))]
    pub async fn process_batch(&self, batch_id: Uuid, options: &ProcessOptions) -> PipelineResult<ProcessingResult> {
        if let Some(min) = options.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(PipelineError::Validation("min_confidence must be within 0..1".into()));
            }
        }

        let batch = self.load_batch(batch_id).await?;
        let engine = ParsingEngine::new(self.rules.active_rules(batch.profession.as_deref()).await?);
        if !engine.invalid_rules().is_empty() {
            tracing::warn!(invalid = engine.invalid_rules().len(), "Skipping parsing rules with invalid patterns");
        }

        let now = self.clock.now();
        let stale_before = now - self.config.stale_after;
        let records = self.imports.list_records(&RecordQuery::batch(batch_id)).await?;

        let mut result = ProcessingResult::default();
        let mut candidates = Vec::new();
        for record in records {
            if record.is_converted() {
                result.skipped += 1;
                continue;
            }
            let expected = record.processing_status;
            let selected = match expected {
                ProcessingStatus::Pending => true,
                ProcessingStatus::Parsed => options.min_confidence.map_or(false, |min| {
                    record.ai_confidence().map_or(true, |c| c < min)
                }),
                ProcessingStatus::Analyzing => {
                    let stale = record.analysis_started_at.map_or(true, |t| t < stale_before);
                    if !stale {
                        result.skipped += 1;
                    }
                    stale
                }
                ProcessingStatus::Failed | ProcessingStatus::Converted => false,
            };
            if selected {
                candidates.push(Candidate { record, expected });
            }
        }
        if let Some(limit) = options.limit {
            candidates.truncate(limit);
        }

        if !candidates.is_empty() && batch.status == BatchStatus::Pending {
            // Losing this race means another run already started the batch
            if self.imports.update_batch(&batch.start(now), &batch).await? {
                tracing::info!("Batch processing started");
            }
        }

        let max_attempts = options.max_attempts.unwrap_or(1).max(1);
        let concurrency = options.concurrency.unwrap_or(self.config.concurrency).max(1);
        let profession = batch.profession.clone();

        let outcomes: Vec<PipelineResult<RecordOutcome>> = stream::iter(candidates)
            .map(|candidate| self.process_record(candidate, &engine, profession.as_deref(), max_attempts))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut errors = Vec::new();
        let mut storage_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(RecordOutcome::Succeeded) => {
                    result.processed += 1;
                    result.succeeded += 1;
                }
                Ok(RecordOutcome::Failed(entry)) => {
                    result.processed += 1;
                    result.failed += 1;
                    errors.push(entry);
                }
                Ok(RecordOutcome::Deferred(entry)) => {
                    result.processed += 1;
                    result.deferred += 1;
                    errors.push(entry);
                }
                Ok(RecordOutcome::Skipped) => result.skipped += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Storage failure while analyzing record");
                    storage_error.get_or_insert(e);
                }
            }
        }

        errors.sort_by_key(|e| e.row_number);
        self.imports.append_batch_errors(batch_id, &errors).await?;
        self.refresh_progress(batch_id).await?;

        if let Some(e) = storage_error {
            return Err(e);
        }

        tracing::info!(
            processed = result.processed,
            succeeded = result.succeeded,
            failed = result.failed,
            deferred = result.deferred,
            skipped = result.skipped,
            "Batch analysis pass finished"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(record_id = %candidate.record.id, row = candidate.record.row_number))]
    async fn process_record(
        &self,
        candidate: Candidate,
        engine: &ParsingEngine,
        profession: Option<&str>,
        max_attempts: u32,
    ) -> PipelineResult<RecordOutcome> {
        // Postgres keeps microseconds; the claim stamp must compare equal after a round trip
        let claimed_at = self.clock.now().trunc_subsecs(6);
        let stale_before = claimed_at - self.config.stale_after;

        let Some(record) = self
            .imports
            .claim_record_for_analysis(candidate.record.id, candidate.expected, claimed_at, stale_before)
            .await?
        else {
            tracing::debug!("Record claimed elsewhere, skipping");
            return Ok(RecordOutcome::Skipped);
        };

        let text = record.raw_text.trim();
        if text.is_empty() {
            let next = record.apply_analysis(
                AnalysisEvent::Rejected {
                    message: "record has no text".into(),
                },
                self.clock.now(),
            );
            if !self.imports.save_record_outcome(&next, claimed_at).await? {
                return Ok(RecordOutcome::Skipped);
            }
            tracing::warn!("Record has no text");
            return Ok(RecordOutcome::Failed(error_entry(&next)));
        }

        let parsed = engine.apply(text);
        if !parsed.matched_rule_ids.is_empty() {
            if let Err(e) = self.rules.record_usage(&parsed.matched_rule_ids).await {
                tracing::warn!(error = %e, "Failed to record rule usage");
            }
        }

        let context = AnalysisContext {
            profession: profession.map(str::to_string),
            hints: parsed.fields.clone(),
            keywords: parsed.keywords.clone(),
        };
        let reply = call_with_timeout(self.config.ai_timeout, self.analyzer.analyze(text, &context))
            .await
            .and_then(|analysis| analysis.validate());

        let now = self.clock.now();
        let event = match reply {
            Ok(analysis) => AnalysisEvent::Analyzed {
                rule_fields: parsed.fields,
                ai_fields: analysis.fields,
                keywords: parsed.keywords,
                matched_rule_ids: parsed.matched_rule_ids,
                analysis: AiAnalysisBlock {
                    confidence: analysis.confidence,
                    category: analysis.category,
                    importance: analysis.importance,
                    raw_payload: analysis.raw_payload,
                    analyzed_at: now,
                },
                review_threshold: self.config.review_threshold,
            },
            Err(e) => {
                tracing::warn!(error = %e, "AI analysis attempt failed");
                AnalysisEvent::AttemptFailed {
                    error: RecordError::from_pipeline(&PipelineError::from(e), now),
                    // A previously parsed record keeps its earlier analysis
                    resume_status: match candidate.expected {
                        ProcessingStatus::Parsed => ProcessingStatus::Parsed,
                        _ => ProcessingStatus::Pending,
                    },
                    max_attempts,
                }
            }
        };
        let attempt_failed = matches!(event, AnalysisEvent::AttemptFailed { .. });

        let next = record.apply_analysis(event, now);
        if !self.imports.save_record_outcome(&next, claimed_at).await? {
            tracing::warn!("Analysis claim was taken over; outcome dropped");
            return Ok(RecordOutcome::Skipped);
        }

        if !attempt_failed {
            tracing::info!(
                confidence = next.ai_confidence().unwrap_or_default(),
                review = next.manual_review_required,
                "Record parsed"
            );
            return Ok(RecordOutcome::Succeeded);
        }
        let entry = error_entry(&next);
        if next.processing_status == ProcessingStatus::Failed {
            Ok(RecordOutcome::Failed(entry))
        } else {
            Ok(RecordOutcome::Deferred(entry))
        }
    }

    /// Recomputes counters from record states and settles the batch status.
    pub async fn refresh_progress(&self, batch_id: Uuid) -> PipelineResult<ImportBatch> {
        refresh_batch(self.imports.as_ref(), batch_id, self.clock.now()).await
    }

    /// Failed, unconverted records go back to `pending`; the progress refresh
    /// re-opens a terminal batch. Returns how many records were reset.
    #[instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn retry_failed(&self, batch_id: Uuid) -> PipelineResult<u64> {
        self.load_batch(batch_id).await?;

        let reset = self.imports.reset_failed_records(batch_id, self.clock.now()).await?;
        self.refresh_progress(batch_id).await?;

        tracing::info!(reset, "Failed records reset for retry");
        Ok(reset)
    }

    /// Applies operator review edits to an unconverted record.
    #[instrument(skip(self, input), fields(record_id = %record_id))]
    pub async fn review_record(&self, record_id: Uuid, input: &RecordReviewInput) -> PipelineResult<Record> {
        let record = self
            .imports
            .get_record(record_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("record {record_id}")))?;
        if !record.can_reprocess() {
            return Err(PipelineError::Conflict("record is already converted".into()));
        }

        let next = record.apply_review(input, self.clock.now());
        if !self.imports.update_record_review(&next).await? {
            return Err(PipelineError::Conflict("record was converted concurrently".into()));
        }
        Ok(next)
    }
}

fn error_entry(record: &Record) -> BatchErrorEntry {
    let message = record
        .parsing_errors
        .last()
        .map(|e| e.message.clone())
        .unwrap_or_default();
    BatchErrorEntry::for_record(record, message, record.updated_at)
}

const BATCH_UPDATE_ATTEMPTS: usize = 5;

/// Shared by the analysis and conversion engines. A lost update re-reads the
/// batch and its record progress before trying again.
pub(crate) async fn refresh_batch(
    imports: &dyn ImportStore,
    batch_id: Uuid,
    now: DateTime<Utc>,
) -> PipelineResult<ImportBatch> {
    for attempt in 1..=BATCH_UPDATE_ATTEMPTS {
        let batch = imports
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("batch {batch_id}")))?;
        let progress = imports.batch_progress(batch_id).await?;

        let next = batch.with_progress(&progress, now);
        if imports.update_batch(&next, &batch).await? {
            if next.status != batch.status {
                tracing::info!(batch_id = %batch_id, status = %next.status, "Batch status changed");
            }
            return Ok(next);
        }
        tracing::debug!(batch_id = %batch_id, attempt, "Batch changed concurrently, re-reading");
    }
    Err(PipelineError::Conflict(format!("batch {batch_id} kept changing during refresh")))
}
