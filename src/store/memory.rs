//! In-memory store
//!
//! All tables live behind one mutex, so every method is trivially atomic.
//! Faults can be injected per write path to exercise the all-or-nothing
//! behavior callers rely on.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{
    EventStore, ImportStore, RecordQuery, RuleStore, ScheduleStore, StoreResult,
};
use crate::domain::{
    AiScheduleAnalysis, AnalysisFeedback, AnalysisStatus, BatchErrorEntry, BatchProgress,
    ConversionStatus, Event, EventAiStatus, ImportBatch, OptimizedScheduleSlot, ParsingRule,
    ProcessingStatus, Record, RecordError, SlotStatus,
};
use crate::error::StorageError;

/// Write paths that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Event inserts, including conversion and slot materialization
    EventWrites,
    /// Terminal analysis writes together with their slots
    SlotWrites,
    /// In-app notification inserts
    NotificationWrites,
    /// Slot reminder flag updates
    SlotFlags,
}

/// A reminder written by the in-app sink.
#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub slot_id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    batches: HashMap<Uuid, ImportBatch>,
    records: HashMap<Uuid, Record>,
    events: HashMap<Uuid, Event>,
    rules: HashMap<Uuid, ParsingRule>,
    analyses: HashMap<Uuid, AiScheduleAnalysis>,
    slots: HashMap<Uuid, OptimizedScheduleSlot>,
    notifications: Vec<StoredNotification>,
    faults: HashSet<Fault>,
}

impl Tables {
    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.contains(&fault) {
            return Err(StorageError::Unavailable(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }
}

fn query_matches(query: &RecordQuery, record: &Record) -> bool {
    record.batch_id == query.batch_id
        && (query.statuses.is_empty() || query.statuses.contains(&record.processing_status))
        && query
            .record_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&record.id))
}

/// Unsent, still scheduled, and inside its reminder lead time.
fn reminder_due(slot: &OptimizedScheduleSlot, now: DateTime<Utc>) -> bool {
    !slot.notification_sent
        && slot.status == SlotStatus::Scheduled
        && now >= slot.start_at - chrono::Duration::minutes(slot.reminder_minutes_before as i64)
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        let mut tables = self.tables.lock();
        if enabled {
            tables.faults.insert(fault);
        } else {
            tables.faults.remove(&fault);
        }
    }

    /// Events that point back at `record_id`.
    pub fn events_for_record(&self, record_id: Uuid) -> Vec<Event> {
        self.tables
            .lock()
            .events
            .values()
            .filter(|e| e.import_record_id == Some(record_id))
            .cloned()
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.tables.lock().events.len()
    }

    pub fn insert_notification(&self, notification: StoredNotification) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        tables.check(Fault::NotificationWrites)?;
        tables.notifications.push(notification);
        Ok(())
    }

    pub fn notifications(&self) -> Vec<StoredNotification> {
        self.tables.lock().notifications.clone()
    }
}

// ============================================================================
// Imports
// ============================================================================

#[async_trait]
impl ImportStore for MemoryStore {
    async fn insert_batch(&self, batch: &ImportBatch, records: &[Record]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        tables.batches.insert(batch.id, batch.clone());
        for record in records {
            tables.records.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> StoreResult<Option<ImportBatch>> {
        Ok(self.tables.lock().batches.get(&id).cloned())
    }

    async fn list_batches(&self, user_id: Uuid, limit: i64, offset: i64) -> StoreResult<Vec<ImportBatch>> {
        let tables = self.tables.lock();
        let mut batches: Vec<ImportBatch> = tables
            .batches
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_batch(&self, batch: &ImportBatch, seen: &ImportBatch) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.batches.get_mut(&batch.id) {
            Some(stored) if stored.status == seen.status && stored.updated_at == seen.updated_at => {
                let error_log = std::mem::take(&mut stored.error_log);
                *stored = batch.clone();
                stored.error_log = error_log;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_batch_errors(&self, batch_id: Uuid, entries: &[BatchErrorEntry]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        if let Some(batch) = tables.batches.get_mut(&batch_id) {
            batch.error_log.extend_from_slice(entries);
        }
        Ok(())
    }

    async fn batch_progress(&self, batch_id: Uuid) -> StoreResult<BatchProgress> {
        let tables = self.tables.lock();
        let mut progress = BatchProgress::default();
        for record in tables.records.values().filter(|r| r.batch_id == batch_id) {
            progress.add(record.processing_status, 1);
        }
        Ok(progress)
    }

    async fn get_record(&self, id: Uuid) -> StoreResult<Option<Record>> {
        Ok(self.tables.lock().records.get(&id).cloned())
    }

    async fn list_records(&self, query: &RecordQuery) -> StoreResult<Vec<Record>> {
        let tables = self.tables.lock();
        let mut records: Vec<Record> = tables
            .records
            .values()
            .filter(|r| query_matches(query, r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.row_number);

        let records = records.into_iter().skip(query.offset.max(0) as usize);
        Ok(match query.limit {
            Some(limit) => records.take(limit.max(0) as usize).collect(),
            None => records.collect(),
        })
    }

    async fn claim_record_for_analysis(
        &self,
        id: Uuid,
        expected: ProcessingStatus,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Record>> {
        let mut tables = self.tables.lock();
        let Some(record) = tables.records.get_mut(&id) else {
            return Ok(None);
        };

        let stale = record
            .analysis_started_at
            .map_or(true, |started| started < stale_before);
        let claimable = record.processing_status == expected
            && record.converted_event_id.is_none()
            && (expected != ProcessingStatus::Analyzing || stale);
        if !claimable {
            return Ok(None);
        }

        record.processing_status = ProcessingStatus::Analyzing;
        record.analysis_started_at = Some(claimed_at);
        record.updated_at = claimed_at;
        Ok(Some(record.clone()))
    }

    async fn save_record_outcome(&self, record: &Record, claimed_at: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.records.get_mut(&record.id) {
            Some(stored)
                if stored.processing_status == ProcessingStatus::Analyzing
                    && stored.analysis_started_at == Some(claimed_at) =>
            {
                *stored = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_record_review(&self, record: &Record) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.records.get_mut(&record.id) {
            Some(stored) if stored.converted_event_id.is_none() => {
                stored.parsed = record.parsed.clone();
                stored.manual_review_required = record.manual_review_required;
                stored.manual_review_notes = record.manual_review_notes.clone();
                stored.updated_at = record.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_failed_records(&self, batch_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.tables.lock();
        let mut reset = 0;
        for record in tables.records.values_mut() {
            if record.batch_id == batch_id
                && record.processing_status == ProcessingStatus::Failed
                && record.converted_event_id.is_none()
            {
                record.processing_status = ProcessingStatus::Pending;
                record.retry_count = 0;
                record.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn convert_record(&self, record_id: Uuid, event: &Event) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.records.get(&record_id) {
            Some(r) if r.converted_event_id.is_none() => {}
            _ => return Ok(false),
        }
        tables.check(Fault::EventWrites)?;

        tables.events.insert(event.id, event.clone());
        if let Some(record) = tables.records.get_mut(&record_id) {
            record.converted_event_id = Some(event.id);
            record.processing_status = ProcessingStatus::Converted;
            record.conversion_status = Some(ConversionStatus::Success);
            record.updated_at = event.created_at;
        }
        Ok(true)
    }

    async fn mark_conversion_failed(&self, record_id: Uuid, error: &RecordError) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.records.get_mut(&record_id) {
            Some(record) if record.converted_event_id.is_none() => {
                record.conversion_status = Some(ConversionStatus::Failed);
                record.parsing_errors.push(error.clone());
                record.updated_at = error.at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flag_manual_review(&self, record_id: Uuid, note: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.records.get_mut(&record_id) {
            Some(record) if record.converted_event_id.is_none() => {
                record.manual_review_required = true;
                record.manual_review_notes = Some(note.to_string());
                record.conversion_status = Some(ConversionStatus::ManualReview);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: &Event) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        tables.check(Fault::EventWrites)?;
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Option<Event>> {
        Ok(self.tables.lock().events.get(&id).cloned())
    }

    async fn list_events(
        &self,
        user_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<Event>> {
        let tables = self.tables.lock();
        let mut events: Vec<Event> = tables
            .events
            .values()
            .filter(|e| e.user_id == user_id)
            .filter(|e| match (from, e.start_at) {
                (Some(from), Some(start)) => start >= from,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|e| match (to, e.start_at) {
                (Some(to), Some(start)) => start < to,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.start_at, e.created_at));
        Ok(events)
    }

    async fn claim_ai_analysis(&self, id: Uuid, claim_id: Uuid, now: DateTime<Utc>) -> StoreResult<Option<Event>> {
        let mut tables = self.tables.lock();
        match tables.events.get_mut(&id) {
            Some(event) if event.can_claim_analysis() => {
                event.ai_status = EventAiStatus::InProgress;
                event.ai_locked = true;
                event.ai_claim_id = Some(claim_id);
                event.updated_at = now;
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn finish_ai_analysis(&self, event: &Event, claim_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.events.get_mut(&event.id) {
            Some(stored)
                if stored.ai_status == EventAiStatus::InProgress && stored.ai_claim_id == Some(claim_id) =>
            {
                *stored = event.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_ai_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.events.get_mut(&id) {
            Some(event) => {
                event.ai_status = EventAiStatus::Pending;
                event.ai_locked = false;
                event.ai_claim_id = None;
                event.ai_error = None;
                event.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn insert_analysis(&self, analysis: &AiScheduleAnalysis) -> StoreResult<()> {
        self.tables.lock().analyses.insert(analysis.id, analysis.clone());
        Ok(())
    }

    async fn start_analysis(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.analyses.get_mut(&id) {
            Some(a) if a.status == AnalysisStatus::Pending => {
                a.status = AnalysisStatus::Processing;
                a.started_at = Some(now);
                a.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_analysis(
        &self,
        analysis: &AiScheduleAnalysis,
        slots: &[OptimizedScheduleSlot],
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.analyses.get(&analysis.id) {
            Some(a) if a.status == AnalysisStatus::Processing => {}
            _ => return Ok(false),
        }
        if !slots.is_empty() {
            tables.check(Fault::SlotWrites)?;
        }

        tables.analyses.insert(analysis.id, analysis.clone());
        for slot in slots {
            tables.slots.insert(slot.id, slot.clone());
        }
        Ok(true)
    }

    async fn get_analysis(&self, id: Uuid) -> StoreResult<Option<AiScheduleAnalysis>> {
        Ok(self.tables.lock().analyses.get(&id).cloned())
    }

    async fn list_analyses(&self, user_id: Uuid, date: Option<NaiveDate>) -> StoreResult<Vec<AiScheduleAnalysis>> {
        let tables = self.tables.lock();
        let mut analyses: Vec<AiScheduleAnalysis> = tables
            .analyses
            .values()
            .filter(|a| a.user_id == user_id)
            .filter(|a| date.map_or(true, |d| a.target_date == d))
            .cloned()
            .collect();
        analyses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(analyses)
    }

    async fn record_feedback(
        &self,
        id: Uuid,
        feedback: &AnalysisFeedback,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.analyses.get_mut(&id) {
            Some(a) => {
                a.user_approved = Some(feedback.approved);
                a.user_rating = feedback.rating;
                a.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_slots(&self, analysis_id: Uuid) -> StoreResult<Vec<OptimizedScheduleSlot>> {
        let tables = self.tables.lock();
        let mut slots: Vec<OptimizedScheduleSlot> = tables
            .slots
            .values()
            .filter(|s| s.analysis_id == analysis_id)
            .cloned()
            .collect();
        slots.sort_by_key(|s| s.start_at);
        Ok(slots)
    }

    async fn get_slot(&self, id: Uuid) -> StoreResult<Option<OptimizedScheduleSlot>> {
        Ok(self.tables.lock().slots.get(&id).cloned())
    }

    async fn due_slots(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<OptimizedScheduleSlot>> {
        let tables = self.tables.lock();
        let mut due: Vec<OptimizedScheduleSlot> = tables
            .slots
            .values()
            .filter(|s| reminder_due(s, now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.start_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_slot_notified(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        tables.check(Fault::SlotFlags)?;
        match tables.slots.get_mut(&slot_id) {
            Some(slot) if !slot.notification_sent => {
                slot.notification_sent = true;
                slot.notification_sent_at = Some(now);
                slot.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn confirm_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.slots.get_mut(&slot_id) {
            Some(slot) if slot.status == SlotStatus::Scheduled && !slot.user_confirmed => {
                slot.user_confirmed = true;
                slot.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_slot(&self, slot_id: Uuid, to: SlotStatus, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.slots.get_mut(&slot_id) {
            Some(slot) if slot.status == SlotStatus::Scheduled => {
                slot.status = to;
                slot.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn materialize_slot_event(&self, slot_id: Uuid, event: &Event) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.slots.get(&slot_id) {
            Some(s) if s.converted_event_id.is_none() => {}
            _ => return Ok(false),
        }
        tables.check(Fault::EventWrites)?;

        tables.events.insert(event.id, event.clone());
        if let Some(slot) = tables.slots.get_mut(&slot_id) {
            slot.converted_event_id = Some(event.id);
            slot.updated_at = event.created_at;
        }
        Ok(true)
    }
}

// ============================================================================
// Rules
// ============================================================================

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_rules(&self, profession: Option<&str>) -> StoreResult<Vec<ParsingRule>> {
        let tables = self.tables.lock();
        let mut rules: Vec<ParsingRule> = tables
            .rules
            .values()
            .filter(|r| r.is_active && r.applies_to(profession))
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.priority_order, r.created_at));
        Ok(rules)
    }

    async fn insert_rule(&self, rule: &ParsingRule) -> StoreResult<()> {
        self.tables.lock().rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        match tables.rules.get_mut(&id) {
            Some(rule) => {
                rule.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_usage(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        for id in rule_ids {
            if let Some(rule) = tables.rules.get_mut(id) {
                rule.usage_count += 1;
            }
        }
        Ok(())
    }

    async fn record_success(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        for id in rule_ids {
            if let Some(rule) = tables.rules.get_mut(id) {
                rule.success_count += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImportFormat, NewImportBatch, NewEvent, EventSource, SourceKind};
    use chrono::Duration;

    fn batch_with(lines: &str) -> (ImportBatch, Vec<Record>) {
        NewImportBatch {
            source_kind: SourceKind::ManualText,
            format: ImportFormat::Text,
            original_filename: None,
            content_ref: None,
            raw_content: Some(lines.into()),
            rows: vec![],
            profession: None,
            profession_confidence: None,
            format_confidence: None,
        }
        .build(Uuid::new_v4(), Utc::now())
    }

    fn event_for(record: &Record) -> Event {
        let mut event = NewEvent {
            title: "Standup".into(),
            description: None,
            start_at: None,
            end_at: None,
            location: None,
            priority: None,
            category: None,
        }
        .into_event(Uuid::new_v4(), EventSource::Import, Utc::now());
        event.import_record_id = Some(record.id);
        event
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_stale() {
        let store = MemoryStore::new();
        let (batch, records) = batch_with("standup 9am");
        store.insert_batch(&batch, &records).await.unwrap();
        let id = records[0].id;
        let now = Utc::now();

        let first = store
            .claim_record_for_analysis(id, ProcessingStatus::Pending, now, now - Duration::minutes(10))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .claim_record_for_analysis(id, ProcessingStatus::Pending, now, now - Duration::minutes(10))
            .await
            .unwrap();
        assert!(second.is_none());

        // Fresh claim is not stale yet
        let reclaim = store
            .claim_record_for_analysis(id, ProcessingStatus::Analyzing, now, now - Duration::minutes(10))
            .await
            .unwrap();
        assert!(reclaim.is_none());

        let later = now + Duration::minutes(11);
        let reclaim = store
            .claim_record_for_analysis(id, ProcessingStatus::Analyzing, later, later - Duration::minutes(10))
            .await
            .unwrap();
        assert!(reclaim.is_some());

        // The original claim has been superseded
        let mut outcome = first.unwrap();
        outcome.processing_status = ProcessingStatus::Parsed;
        assert!(!store.save_record_outcome(&outcome, now).await.unwrap());
    }

    #[tokio::test]
    async fn conversion_is_one_shot() {
        let store = MemoryStore::new();
        let (batch, records) = batch_with("standup 9am");
        store.insert_batch(&batch, &records).await.unwrap();
        let record = &records[0];

        assert!(store.convert_record(record.id, &event_for(record)).await.unwrap());
        assert!(!store.convert_record(record.id, &event_for(record)).await.unwrap());
        assert_eq!(store.events_for_record(record.id).len(), 1);
    }

    #[tokio::test]
    async fn failed_event_write_leaves_record_untouched() {
        let store = MemoryStore::new();
        let (batch, records) = batch_with("standup 9am");
        store.insert_batch(&batch, &records).await.unwrap();
        let record = &records[0];

        store.set_fault(Fault::EventWrites, true);
        assert!(store.convert_record(record.id, &event_for(record)).await.is_err());

        let stored = store.get_record(record.id).await.unwrap().unwrap();
        assert!(stored.converted_event_id.is_none());
        assert_eq!(store.event_count(), 0);
    }
}
