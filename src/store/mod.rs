//! Storage interfaces
//!
//! Every state change that can race goes through a conditional update that
//! reports whether it applied. Callers treat `false` as a lost race.
//!
//! - [`PgStore`]: Postgres via sqlx
//! - `MemoryStore`: in-process tables with fault injection, for tests
//! - [`CachedRules`]: Redis read-through cache for parsing rules

pub mod cached;
#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::domain::{
    AiScheduleAnalysis, AnalysisFeedback, BatchErrorEntry, BatchProgress, Event, ImportBatch,
    OptimizedScheduleSlot, ParsingRule, ProcessingStatus, Record, RecordError, SlotStatus,
};
use crate::error::StorageError;

pub use cached::CachedRules;
#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, StorageError>;

/// Record selection. Results are ordered by row number.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub batch_id: Uuid,
    /// Restrict to these statuses (any when empty)
    pub statuses: Vec<ProcessingStatus>,
    /// Restrict to these ids
    pub record_ids: Option<Vec<Uuid>>,
    pub limit: Option<i64>,
    pub offset: i64,
}

impl RecordQuery {
    pub fn batch(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ImportStore: Send + Sync {
    /// Inserts the batch and all of its records in one transaction.
    async fn insert_batch(&self, batch: &ImportBatch, records: &[Record]) -> StoreResult<()>;

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ImportBatch>>;

    /// Newest first.
    async fn list_batches(&self, user_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<ImportBatch>>;

    /// Persists status, counters and timestamps (not the error log), only if
    /// the stored status and `updated_at` still match `seen`.
    async fn update_batch(&self, batch: &ImportBatch, seen: &ImportBatch) -> StoreResult<bool>;

    async fn append_batch_errors(&self, batch_id: Uuid, entries: &[BatchErrorEntry]) -> StoreResult<()>;

    async fn batch_progress(&self, batch_id: Uuid) -> StoreResult<BatchProgress>;

    async fn get_record(&self, id: Uuid) -> StoreResult<Option<Record>>;

    async fn list_records(&self, query: &RecordQuery) -> StoreResult<Vec<Record>>;

    /// Moves an unconverted record from `expected` to `analyzing`, stamping
    /// `claimed_at`. An `analyzing` record is only claimable when its claim
    /// is older than `stale_before`.
    async fn claim_record_for_analysis(
        &self,
        id: Uuid,
        expected: ProcessingStatus,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Record>>;

    /// Writes the outcome of an analysis attempt, but only while the claim
    /// stamped with `claimed_at` is still held.
    async fn save_record_outcome(&self, record: &Record, claimed_at: DateTime<Utc>) -> StoreResult<bool>;

    /// Saves review edits; refused once the record is converted.
    async fn update_record_review(&self, record: &Record) -> StoreResult<bool>;

    /// Failed, unconverted records go back to `pending` with a fresh retry budget.
    async fn reset_failed_records(&self, batch_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Inserts `event` and links it to the record in one transaction.
    /// Returns false, inserting nothing, when the record was already converted.
    async fn convert_record(&self, record_id: Uuid, event: &Event) -> StoreResult<bool>;

    async fn mark_conversion_failed(&self, record_id: Uuid, error: &RecordError) -> StoreResult<bool>;

    /// Flags an unconverted record for review and sets its conversion status
    /// to `manual_review`.
    async fn flag_manual_review(&self, record_id: Uuid, note: &str, now: DateTime<Utc>) -> StoreResult<bool>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: &Event) -> StoreResult<()>;

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<Event>>;

    /// Events of a user, optionally limited to those starting in `[from, to)`.
    async fn list_events(
        &self,
        user_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Event>>;

    /// Sets `in_progress` + locked and stamps `claim_id` in one update, only if
    /// the event is unlocked and pending or failed.
    async fn claim_ai_analysis(&self, id: Uuid, claim_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Event>>;

    /// Stores the analysis result; applies only while `in_progress` under the
    /// same `claim_id`.
    async fn finish_ai_analysis(&self, event: &Event, claim_id: Uuid) -> StoreResult<bool>;

    /// Unlocks and returns the event to `pending`, dropping any claim.
    async fn reset_ai_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_analysis(&self, analysis: &AiScheduleAnalysis) -> StoreResult<()>;

    /// `pending -> processing`
    async fn start_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Writes the terminal analysis and its slots in one transaction;
    /// applies only while the analysis is `processing`.
    async fn finish_analysis(
        &self,
        analysis: &AiScheduleAnalysis,
        slots: &[OptimizedScheduleSlot],
    ) -> StoreResult<bool>;

    async fn get_analysis(&self, id: Uuid) -> StoreResult<Option<AiScheduleAnalysis>>;

    /// Newest first.
    async fn list_analyses(&self, user_id: Uuid, date: Option<NaiveDate>) -> StoreResult<Vec<AiScheduleAnalysis>>;

    async fn record_feedback(
        &self,
        id: Uuid,
        feedback: &AnalysisFeedback,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Ordered by start time.
    async fn list_slots(&self, analysis_id: Uuid) -> StoreResult<Vec<OptimizedScheduleSlot>>;

    async fn get_slot(&self, id: Uuid) -> StoreResult<Option<OptimizedScheduleSlot>>;

    /// Unsent reminders of scheduled slots whose lead time has been reached.
    async fn due_slots(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OptimizedScheduleSlot>>;

    /// `notification_sent: false -> true`
    async fn mark_slot_notified(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn confirm_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    /// `scheduled -> to`
    async fn transition_slot(&self, slot_id: Uuid, to: SlotStatus, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Inserts `event` and links it to the slot in one transaction, only if
    /// the slot has no event yet.
    async fn materialize_slot_event(&self, slot_id: Uuid, event: &Event) -> StoreResult<bool>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Active global rules plus those scoped to `profession`, ordered by
    /// `priority_order` then creation time.
    async fn active_rules(&self, profession: Option<&str>) -> StoreResult<Vec<ParsingRule>>;

    async fn insert_rule(&self, rule: &ParsingRule) -> StoreResult<()>;

    async fn set_rule_active(&self, id: Uuid, active: bool) -> StoreResult<bool>;

    async fn record_usage(&self, rule_ids: &[Uuid]) -> StoreResult<()>;

    async fn record_success(&self, rule_ids: &[Uuid]) -> StoreResult<()>;
}
