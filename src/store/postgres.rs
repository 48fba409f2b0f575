//! Postgres store
//!
//! Conditional updates are plain `UPDATE ... WHERE <expected state>` whose
//! `rows_affected` tells the caller whether it won. Multi-row steps run in a
//! transaction and roll back on any error.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{EventStore, ImportStore, RecordQuery, RuleStore, ScheduleStore, StoreResult};
use crate::domain::{
    AiAnalysisBlock, AiScheduleAnalysis, AnalysisFeedback, AnalysisStatus, BatchErrorEntry,
    BatchProgress, BatchStatus, ConversionStatus, Event, EventAiStatus, EventSource, ImportBatch,
    ImportFormat, OptimizedScheduleSlot, ParsedFields, ParsingRule, Priority, ProcessingStatus,
    Record, RecordError, RuleAction, RuleCondition, ScheduleMetrics, SchedulePreferences,
    SlotStatus, SourceKind, TaskInput,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Rows
// ============================================================================

const BATCH_COLUMNS: &str = "id, user_id, source_kind, format, original_filename, byte_size, \
     content_ref, status, total_found, succeeded, failed, error_log, profession, \
     profession_confidence, format_confidence, started_at, completed_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct BatchRow {
    id: Uuid,
    user_id: Uuid,
    source_kind: SourceKind,
    format: ImportFormat,
    original_filename: Option<String>,
    byte_size: i64,
    content_ref: Option<String>,
    status: BatchStatus,
    total_found: i32,
    succeeded: i32,
    failed: i32,
    error_log: Json<Vec<BatchErrorEntry>>,
    profession: Option<String>,
    profession_confidence: Option<f64>,
    format_confidence: Option<f64>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BatchRow> for ImportBatch {
    fn from(row: BatchRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            source_kind: row.source_kind,
            format: row.format,
            original_filename: row.original_filename,
            byte_size: row.byte_size,
            content_ref: row.content_ref,
            status: row.status,
            total_found: row.total_found,
            succeeded: row.succeeded,
            failed: row.failed,
            error_log: row.error_log.0,
            profession: row.profession,
            profession_confidence: row.profession_confidence,
            format_confidence: row.format_confidence,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const RECORD_COLUMNS: &str = "id, batch_id, row_number, raw_text, original_fields, parsed, \
     detected_keywords, matched_rule_ids, ai_analysis, processing_status, conversion_status, \
     converted_event_id, manual_review_required, manual_review_notes, parsing_errors, \
     retry_count, analysis_started_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    batch_id: Uuid,
    row_number: i32,
    raw_text: String,
    original_fields: Option<serde_json::Value>,
    parsed: Json<ParsedFields>,
    detected_keywords: Vec<String>,
    matched_rule_ids: Vec<Uuid>,
    ai_analysis: Option<Json<AiAnalysisBlock>>,
    processing_status: ProcessingStatus,
    conversion_status: Option<ConversionStatus>,
    converted_event_id: Option<Uuid>,
    manual_review_required: bool,
    manual_review_notes: Option<String>,
    parsing_errors: Json<Vec<RecordError>>,
    retry_count: i32,
    analysis_started_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            batch_id: row.batch_id,
            row_number: row.row_number,
            raw_text: row.raw_text,
            original_fields: row.original_fields,
            parsed: row.parsed.0,
            detected_keywords: row.detected_keywords,
            matched_rule_ids: row.matched_rule_ids,
            ai_analysis: row.ai_analysis.map(|j| j.0),
            processing_status: row.processing_status,
            conversion_status: row.conversion_status,
            converted_event_id: row.converted_event_id,
            manual_review_required: row.manual_review_required,
            manual_review_notes: row.manual_review_notes,
            parsing_errors: row.parsing_errors.0,
            retry_count: row.retry_count,
            analysis_started_at: row.analysis_started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const EVENT_COLUMNS: &str = "id, user_id, title, description, start_at, end_at, location, \
     priority, category, source, import_record_id, schedule_slot_id, ai_status, ai_locked, \
     ai_claim_id, ai_analysis, ai_error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    description: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    location: Option<String>,
    priority: Option<Priority>,
    category: Option<String>,
    source: EventSource,
    import_record_id: Option<Uuid>,
    schedule_slot_id: Option<Uuid>,
    ai_status: EventAiStatus,
    ai_locked: bool,
    ai_claim_id: Option<Uuid>,
    ai_analysis: Option<Json<AiAnalysisBlock>>,
    ai_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            description: row.description,
            start_at: row.start_at,
            end_at: row.end_at,
            location: row.location,
            priority: row.priority,
            category: row.category,
            source: row.source,
            import_record_id: row.import_record_id,
            schedule_slot_id: row.schedule_slot_id,
            ai_status: row.ai_status,
            ai_locked: row.ai_locked,
            ai_claim_id: row.ai_claim_id,
            ai_analysis: row.ai_analysis.map(|j| j.0),
            ai_error: row.ai_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const RULE_COLUMNS: &str = "id, name, pattern, action, conditions, profession, priority_order, \
     is_active, usage_count, success_count, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    pattern: String,
    action: Json<RuleAction>,
    conditions: Json<Vec<RuleCondition>>,
    profession: Option<String>,
    priority_order: i32,
    is_active: bool,
    usage_count: i64,
    success_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RuleRow> for ParsingRule {
    fn from(row: RuleRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            pattern: row.pattern,
            action: row.action.0,
            conditions: row.conditions.0,
            profession: row.profession,
            priority_order: row.priority_order,
            is_active: row.is_active,
            usage_count: row.usage_count,
            success_count: row.success_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const ANALYSIS_COLUMNS: &str = "id, user_id, target_date, tasks, preferences, status, \
     ai_response, metrics, unplaced_task_ids, error, retry_count, retried_from, user_approved, \
     user_rating, started_at, completed_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    user_id: Uuid,
    target_date: NaiveDate,
    tasks: Json<Vec<TaskInput>>,
    preferences: Json<SchedulePreferences>,
    status: AnalysisStatus,
    ai_response: Option<serde_json::Value>,
    metrics: Option<Json<ScheduleMetrics>>,
    unplaced_task_ids: Vec<String>,
    error: Option<String>,
    retry_count: i32,
    retried_from: Option<Uuid>,
    user_approved: Option<bool>,
    user_rating: Option<i16>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AnalysisRow> for AiScheduleAnalysis {
    fn from(row: AnalysisRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            target_date: row.target_date,
            tasks: row.tasks.0,
            preferences: row.preferences.0,
            status: row.status,
            ai_response: row.ai_response,
            metrics: row.metrics.map(|j| j.0),
            unplaced_task_ids: row.unplaced_task_ids,
            error: row.error,
            retry_count: row.retry_count,
            retried_from: row.retried_from,
            user_approved: row.user_approved,
            user_rating: row.user_rating,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SLOT_COLUMNS: &str = "id, analysis_id, user_id, date, start_at, end_at, duration_minutes, \
     task_id, title, description, priority, category, suitability_score, is_flexible, \
     reminder_minutes_before, notification_sent, notification_sent_at, user_confirmed, status, \
     source_record_id, converted_event_id, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct SlotRow {
    id: Uuid,
    analysis_id: Uuid,
    user_id: Uuid,
    date: NaiveDate,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    duration_minutes: i32,
    task_id: String,
    title: String,
    description: Option<String>,
    priority: Priority,
    category: Option<String>,
    suitability_score: Option<f64>,
    is_flexible: bool,
    reminder_minutes_before: i32,
    notification_sent: bool,
    notification_sent_at: Option<DateTime<Utc>>,
    user_confirmed: bool,
    status: SlotStatus,
    source_record_id: Option<Uuid>,
    converted_event_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SlotRow> for OptimizedScheduleSlot {
    fn from(row: SlotRow) -> Self {
        Self {
            id: row.id,
            analysis_id: row.analysis_id,
            user_id: row.user_id,
            date: row.date,
            start_at: row.start_at,
            end_at: row.end_at,
            duration_minutes: row.duration_minutes,
            task_id: row.task_id,
            title: row.title,
            description: row.description,
            priority: row.priority,
            category: row.category,
            suitability_score: row.suitability_score,
            is_flexible: row.is_flexible,
            reminder_minutes_before: row.reminder_minutes_before,
            notification_sent: row.notification_sent,
            notification_sent_at: row.notification_sent_at,
            user_confirmed: row.user_confirmed,
            status: row.status,
            source_record_id: row.source_record_id,
            converted_event_id: row.converted_event_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// ============================================================================
// Shared statements
// ============================================================================

async fn insert_event_tx(tx: &mut Transaction<'_, Postgres>, event: &Event) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO events (id, user_id, title, description, start_at, end_at, location,
                            priority, category, source, import_record_id, schedule_slot_id,
                            ai_status, ai_locked, ai_claim_id, ai_analysis, ai_error, created_at,
                            updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(event.id)
    .bind(event.user_id)
    .bind(&event.title)
    .bind(&event.description)
    .bind(event.start_at)
    .bind(event.end_at)
    .bind(&event.location)
    .bind(event.priority)
    .bind(&event.category)
    .bind(event.source)
    .bind(event.import_record_id)
    .bind(event.schedule_slot_id)
    .bind(event.ai_status)
    .bind(event.ai_locked)
    .bind(event.ai_claim_id)
    .bind(event.ai_analysis.as_ref().map(Json))
    .bind(&event.ai_error)
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Imports
// ============================================================================

#[async_trait]
impl ImportStore for PgStore {
    async fn insert_batch(&self, batch: &ImportBatch, records: &[Record]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO import_batches (id, user_id, source_kind, format, original_filename,
                                        byte_size, content_ref, status, total_found, succeeded,
                                        failed, error_log, profession, profession_confidence,
                                        format_confidence, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(batch.id)
        .bind(batch.user_id)
        .bind(batch.source_kind)
        .bind(batch.format)
        .bind(&batch.original_filename)
        .bind(batch.byte_size)
        .bind(&batch.content_ref)
        .bind(batch.status)
        .bind(batch.total_found)
        .bind(batch.succeeded)
        .bind(batch.failed)
        .bind(Json(&batch.error_log))
        .bind(&batch.profession)
        .bind(batch.profession_confidence)
        .bind(batch.format_confidence)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&mut *tx)
        .await?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO import_records (id, batch_id, row_number, raw_text, original_fields,
                                            parsed, processing_status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(record.id)
            .bind(record.batch_id)
            .bind(record.row_number)
            .bind(&record.raw_text)
            .bind(&record.original_fields)
            .bind(Json(&record.parsed))
            .bind(record.processing_status)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ImportBatch>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM import_batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_batches(&self, user_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<ImportBatch>> {
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM import_batches WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_batch(&self, batch: &ImportBatch, seen: &ImportBatch) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_batches
            SET status = $2, succeeded = $3, failed = $4, started_at = $5,
                completed_at = $6, updated_at = $7
            WHERE id = $1 AND status = $8 AND updated_at = $9
            "#,
        )
        .bind(batch.id)
        .bind(batch.status)
        .bind(batch.succeeded)
        .bind(batch.failed)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .bind(batch.updated_at)
        .bind(seen.status)
        .bind(seen.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_batch_errors(&self, batch_id: Uuid, entries: &[BatchErrorEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE import_batches SET error_log = error_log || $2 WHERE id = $1")
            .bind(batch_id)
            .bind(Json(entries))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn batch_progress(&self, batch_id: Uuid) -> StoreResult<BatchProgress> {
        let rows: Vec<(ProcessingStatus, i64)> = sqlx::query_as(
            "SELECT processing_status, COUNT(*) FROM import_records WHERE batch_id = $1 GROUP BY processing_status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut progress = BatchProgress::default();
        for (status, count) in rows {
            progress.add(status, count as i32);
        }
        Ok(progress)
    }

    async fn get_record(&self, id: Uuid) -> StoreResult<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM import_records WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_records(&self, query: &RecordQuery) -> StoreResult<Vec<Record>> {
        let statuses: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM import_records
            WHERE batch_id = $1
              AND (cardinality($2::text[]) = 0 OR processing_status = ANY($2))
              AND ($3::uuid[] IS NULL OR id = ANY($3))
            ORDER BY row_number
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(query.batch_id)
        .bind(&statuses)
        .bind(&query.record_ids)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_record_for_analysis(
        &self,
        id: Uuid,
        expected: ProcessingStatus,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            UPDATE import_records
            SET processing_status = 'analyzing', analysis_started_at = $3, updated_at = $3
            WHERE id = $1
              AND processing_status = $2
              AND converted_event_id IS NULL
              AND ($2 <> 'analyzing' OR analysis_started_at IS NULL OR analysis_started_at < $4)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected)
        .bind(claimed_at)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn save_record_outcome(&self, record: &Record, claimed_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_records
            SET parsed = $3, detected_keywords = $4, matched_rule_ids = $5, ai_analysis = $6,
                processing_status = $7, conversion_status = $8, manual_review_required = $9,
                parsing_errors = $10, retry_count = $11, analysis_started_at = $12, updated_at = $13
            WHERE id = $1 AND processing_status = 'analyzing' AND analysis_started_at = $2
            "#,
        )
        .bind(record.id)
        .bind(claimed_at)
        .bind(Json(&record.parsed))
        .bind(&record.detected_keywords)
        .bind(&record.matched_rule_ids)
        .bind(record.ai_analysis.as_ref().map(Json))
        .bind(record.processing_status)
        .bind(record.conversion_status)
        .bind(record.manual_review_required)
        .bind(Json(&record.parsing_errors))
        .bind(record.retry_count)
        .bind(record.analysis_started_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_record_review(&self, record: &Record) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_records
            SET parsed = $2, manual_review_required = $3, manual_review_notes = $4, updated_at = $5
            WHERE id = $1 AND converted_event_id IS NULL
            "#,
        )
        .bind(record.id)
        .bind(Json(&record.parsed))
        .bind(record.manual_review_required)
        .bind(&record.manual_review_notes)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_failed_records(&self, batch_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE import_records
            SET processing_status = 'pending', retry_count = 0, updated_at = $2
            WHERE batch_id = $1 AND processing_status = 'failed' AND converted_event_id IS NULL
            "#,
        )
        .bind(batch_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn convert_record(&self, record_id: Uuid, event: &Event) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Row lock first so a concurrent conversion waits and then sees the link
        let open: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM import_records WHERE id = $1 AND converted_event_id IS NULL FOR UPDATE",
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await?;
        if open.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_event_tx(&mut tx, event).await?;

        sqlx::query(
            r#"
            UPDATE import_records
            SET converted_event_id = $2, processing_status = 'converted',
                conversion_status = 'success', updated_at = $3
            WHERE id = $1 AND converted_event_id IS NULL
            "#,
        )
        .bind(record_id)
        .bind(event.id)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_conversion_failed(&self, record_id: Uuid, error: &RecordError) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_records
            SET conversion_status = 'failed', parsing_errors = parsing_errors || $2, updated_at = $3
            WHERE id = $1 AND converted_event_id IS NULL
            "#,
        )
        .bind(record_id)
        .bind(Json(vec![error]))
        .bind(error.at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn flag_manual_review(&self, record_id: Uuid, note: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE import_records
            SET manual_review_required = TRUE, manual_review_notes = $2,
                conversion_status = 'manual_review', updated_at = $3
            WHERE id = $1 AND converted_event_id IS NULL
            "#,
        )
        .bind(record_id)
        .bind(note)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// Events
// ============================================================================

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_events(
        &self,
        user_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {EVENT_COLUMNS} FROM events
            WHERE user_id = $1
              AND ($2::timestamptz IS NULL OR start_at >= $2)
              AND ($3::timestamptz IS NULL OR start_at < $3)
            ORDER BY start_at NULLS FIRST, created_at
            "#
        ))
        .bind(user_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_ai_analysis(&self, id: Uuid, claim_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Event>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET ai_status = 'in_progress', ai_locked = TRUE, ai_claim_id = $3, updated_at = $2
            WHERE id = $1 AND ai_locked = FALSE AND ai_status IN ('pending', 'failed')
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn finish_ai_analysis(&self, event: &Event, claim_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET ai_status = $2, ai_locked = $3, ai_analysis = $4, ai_error = $5,
                category = $6, priority = $7, updated_at = $8, ai_claim_id = NULL
            WHERE id = $1 AND ai_status = 'in_progress' AND ai_claim_id = $9
            "#,
        )
        .bind(event.id)
        .bind(event.ai_status)
        .bind(event.ai_locked)
        .bind(event.ai_analysis.as_ref().map(Json))
        .bind(&event.ai_error)
        .bind(&event.category)
        .bind(event.priority)
        .bind(event.updated_at)
        .bind(claim_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_ai_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET ai_status = 'pending', ai_locked = FALSE, ai_claim_id = NULL, ai_error = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

// ============================================================================
// Schedule
// ============================================================================

#[async_trait]
impl ScheduleStore for PgStore {
    async fn insert_analysis(&self, analysis: &AiScheduleAnalysis) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_schedule_analyses (id, user_id, target_date, tasks, preferences, status,
                                              retry_count, retried_from, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.user_id)
        .bind(analysis.target_date)
        .bind(Json(&analysis.tasks))
        .bind(Json(&analysis.preferences))
        .bind(analysis.status)
        .bind(analysis.retry_count)
        .bind(analysis.retried_from)
        .bind(analysis.created_at)
        .bind(analysis.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn start_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ai_schedule_analyses
            SET status = 'processing', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_analysis(
        &self,
        analysis: &AiScheduleAnalysis,
        slots: &[OptimizedScheduleSlot],
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE ai_schedule_analyses
            SET status = $2, ai_response = $3, metrics = $4, unplaced_task_ids = $5,
                error = $6, completed_at = $7, updated_at = $8
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.status)
        .bind(&analysis.ai_response)
        .bind(analysis.metrics.as_ref().map(Json))
        .bind(&analysis.unplaced_task_ids)
        .bind(&analysis.error)
        .bind(analysis.completed_at)
        .bind(analysis.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for slot in slots {
            sqlx::query(
                r#"
                INSERT INTO optimized_schedule_slots (
                    id, analysis_id, user_id, date, start_at, end_at, duration_minutes, task_id,
                    title, description, priority, category, suitability_score, is_flexible,
                    reminder_minutes_before, status, source_record_id, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                "#,
            )
            .bind(slot.id)
            .bind(slot.analysis_id)
            .bind(slot.user_id)
            .bind(slot.date)
            .bind(slot.start_at)
            .bind(slot.end_at)
            .bind(slot.duration_minutes)
            .bind(&slot.task_id)
            .bind(&slot.title)
            .bind(&slot.description)
            .bind(slot.priority)
            .bind(&slot.category)
            .bind(slot.suitability_score)
            .bind(slot.is_flexible)
            .bind(slot.reminder_minutes_before)
            .bind(slot.status)
            .bind(slot.source_record_id)
            .bind(slot.created_at)
            .bind(slot.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_analysis(&self, id: Uuid) -> StoreResult<Option<AiScheduleAnalysis>> {
        let row = sqlx::query_as::<_, AnalysisRow>(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM ai_schedule_analyses WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_analyses(&self, user_id: Uuid, date: Option<NaiveDate>) -> StoreResult<Vec<AiScheduleAnalysis>> {
        let rows = sqlx::query_as::<_, AnalysisRow>(&format!(
            r#"
            SELECT {ANALYSIS_COLUMNS} FROM ai_schedule_analyses
            WHERE user_id = $1 AND ($2::date IS NULL OR target_date = $2)
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn record_feedback(
        &self,
        id: Uuid,
        feedback: &AnalysisFeedback,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE ai_schedule_analyses SET user_approved = $2, user_rating = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(feedback.approved)
        .bind(feedback.rating)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_slots(&self, analysis_id: Uuid) -> StoreResult<Vec<OptimizedScheduleSlot>> {
        let rows = sqlx::query_as::<_, SlotRow>(&format!(
            "SELECT {SLOT_COLUMNS} FROM optimized_schedule_slots WHERE analysis_id = $1 ORDER BY start_at"
        ))
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_slot(&self, id: Uuid) -> StoreResult<Option<OptimizedScheduleSlot>> {
        let row = sqlx::query_as::<_, SlotRow>(&format!(
            "SELECT {SLOT_COLUMNS} FROM optimized_schedule_slots WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn due_slots(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OptimizedScheduleSlot>> {
        let rows = sqlx::query_as::<_, SlotRow>(&format!(
            r#"
            SELECT {SLOT_COLUMNS} FROM optimized_schedule_slots
            WHERE notification_sent = FALSE
              AND status = 'scheduled'
              AND start_at - make_interval(mins => reminder_minutes_before) <= $1
            ORDER BY start_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_slot_notified(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE optimized_schedule_slots
            SET notification_sent = TRUE, notification_sent_at = $2, updated_at = $2
            WHERE id = $1 AND notification_sent = FALSE
            "#,
        )
        .bind(slot_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn confirm_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE optimized_schedule_slots
            SET user_confirmed = TRUE, updated_at = $2
            WHERE id = $1 AND status = 'scheduled' AND user_confirmed = FALSE
            "#,
        )
        .bind(slot_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_slot(&self, slot_id: Uuid, to: SlotStatus, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE optimized_schedule_slots SET status = $2, updated_at = $3 WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(slot_id)
        .bind(to)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn materialize_slot_event(&self, slot_id: Uuid, event: &Event) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let open: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM optimized_schedule_slots WHERE id = $1 AND converted_event_id IS NULL FOR UPDATE",
        )
        .bind(slot_id)
        .fetch_optional(&mut *tx)
        .await?;
        if open.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_event_tx(&mut tx, event).await?;

        sqlx::query(
            "UPDATE optimized_schedule_slots SET converted_event_id = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(slot_id)
        .bind(event.id)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

// ============================================================================
// Rules
// ============================================================================

#[async_trait]
impl RuleStore for PgStore {
    async fn active_rules(&self, profession: Option<&str>) -> StoreResult<Vec<ParsingRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            r#"
            SELECT {RULE_COLUMNS} FROM parsing_rules
            WHERE is_active = TRUE AND (profession IS NULL OR profession = lower($1))
            ORDER BY priority_order, created_at
            "#
        ))
        .bind(profession)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_rule(&self, rule: &ParsingRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parsing_rules (id, name, pattern, action, conditions, profession,
                                       priority_order, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.pattern)
        .bind(Json(&rule.action))
        .bind(Json(&rule.conditions))
        .bind(&rule.profession)
        .bind(rule.priority_order)
        .bind(rule.is_active)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE parsing_rules SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_usage(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE parsing_rules SET usage_count = usage_count + 1 WHERE id = ANY($1)")
            .bind(rule_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_success(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        if rule_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE parsing_rules SET success_count = success_count + 1 WHERE id = ANY($1)")
            .bind(rule_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
