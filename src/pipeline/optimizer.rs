//! Schedule optimization orchestration
//!
//! The placement itself belongs to the AI collaborator. This engine owns the
//! analysis lifecycle: `pending → processing → completed | partial | failed`,
//! with the terminal status and its slots written in one store call.

use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::clock::Clock;
use super::collaborators::{call_with_timeout, OptimizationPlan, OptimizationRequest, ScheduleOptimizerAi};
use super::PipelineConfig;
use crate::domain::{
    AiScheduleAnalysis, AnalysisFeedback, AnalysisReport, AnalysisStatus, Event, EventSource, NewEvent,
    OptimizedScheduleSlot, ScheduleMetrics, SchedulePreferences, SlotStatus, TaskInput,
};
use crate::error::{PipelineError, PipelineResult};
use crate::store::{EventStore, ScheduleStore};

pub struct ScheduleOptimizer {
    schedule: Arc<dyn ScheduleStore>,
    events: Arc<dyn EventStore>,
    optimizer: Arc<dyn ScheduleOptimizerAi>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl ScheduleOptimizer {
    pub fn new(
        schedule: Arc<dyn ScheduleStore>,
        events: Arc<dyn EventStore>,
        optimizer: Arc<dyn ScheduleOptimizerAi>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            schedule,
            events,
            optimizer,
            clock,
            config,
        }
    }

    // ========================================================================
    // Analyses
    // ========================================================================

    /// Creates a new analysis for `target_date` and runs it to a terminal status.
    /// Earlier analyses for the same date are never touched.
    #[instrument(skip(self, tasks, preferences), fields(user_id = %user_id, date = %target_date, tasks = tasks.len()))]
    pub async fn optimize(
        &self,
        user_id: Uuid,
        tasks: Vec<TaskInput>,
        preferences: SchedulePreferences,
        target_date: NaiveDate,
    ) -> PipelineResult<AiScheduleAnalysis> {
        validate_request(&tasks, &preferences)?;

        let analysis = AiScheduleAnalysis::new(user_id, target_date, tasks, preferences, self.clock.now());
        self.schedule.insert_analysis(&analysis).await?;
        tracing::info!(analysis_id = %analysis.id, "Schedule analysis created");

        self.run(analysis).await
    }

    /// Re-runs a failed or partial analysis as a new analysis over the same snapshot.
    #[instrument(skip(self), fields(analysis_id = %analysis_id))]
    pub async fn retry_analysis(&self, analysis_id: Uuid) -> PipelineResult<AiScheduleAnalysis> {
        let previous = self.load(analysis_id).await?;
        if !matches!(previous.status, AnalysisStatus::Failed | AnalysisStatus::Partial) {
            return Err(PipelineError::Conflict(format!(
                "only failed or partial analyses can be retried (status is {})",
                previous.status
            )));
        }

        let analysis = previous.retry(self.clock.now());
        self.schedule.insert_analysis(&analysis).await?;
        tracing::info!(new_analysis_id = %analysis.id, retry_count = analysis.retry_count, "Schedule analysis retried");

        self.run(analysis).await
    }

    async fn run(&self, analysis: AiScheduleAnalysis) -> PipelineResult<AiScheduleAnalysis> {
        let now = self.clock.now();
        if !self.schedule.start_analysis(analysis.id, now).await? {
            return Err(PipelineError::Conflict(format!("analysis {} already started", analysis.id)));
        }
        let mut analysis = analysis;
        analysis.status = AnalysisStatus::Processing;
        analysis.started_at = Some(now);

        let request = OptimizationRequest {
            tasks: analysis.tasks.clone(),
            preferences: analysis.preferences.clone(),
            target_date: analysis.target_date,
        };
        let reply = call_with_timeout(self.config.ai_timeout, self.optimizer.optimize(&request)).await;

        let now = self.clock.now();
        let (next, slots) = match reply {
            Ok(plan) => match self.build_slots(&analysis, &plan, now) {
                Ok(slots) => {
                    let total: i64 = slots.iter().map(|s| s.duration_minutes as i64).sum();
                    let metrics = ScheduleMetrics::compute(
                        total,
                        analysis.preferences.available_minutes(),
                        plan.metrics.clone(),
                    );
                    let response = if plan.raw_payload.is_null() {
                        serde_json::to_value(&plan).unwrap_or_default()
                    } else {
                        plan.raw_payload.clone()
                    };
                    (analysis.finished(response, metrics, plan.unplaced_task_ids.clone(), now), slots)
                }
                Err(message) => {
                    tracing::warn!(error = %message, "Optimizer returned an unusable plan");
                    (analysis.failed(&format!("bad_response: {message}"), now), Vec::new())
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Schedule optimization failed");
                (analysis.failed(&e.to_string(), now), Vec::new())
            }
        };

        match self.schedule.finish_analysis(&next, &slots).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(PipelineError::Conflict(format!("analysis {} finished concurrently", next.id)));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to persist analysis outcome");
                let failed = analysis.failed(&format!("storage: {e}"), self.clock.now());
                if let Err(mark_err) = self.schedule.finish_analysis(&failed, &[]).await {
                    tracing::error!(error = %mark_err, "Failed to mark analysis failed");
                }
                return Err(e.into());
            }
        }

        tracing::info!(
            analysis_id = %next.id,
            status = %next.status,
            slots = slots.len(),
            "Schedule analysis finished"
        );
        Ok(next)
    }

    /// Turns the plan into slots, rejecting the whole plan if any slot is unusable.
    fn build_slots(
        &self,
        analysis: &AiScheduleAnalysis,
        plan: &OptimizationPlan,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<OptimizedScheduleSlot>, String> {
        let tasks: HashMap<&str, &TaskInput> = analysis.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut placed = HashSet::new();
        let mut slots = Vec::with_capacity(plan.slots.len());

        for planned in &plan.slots {
            let task = tasks
                .get(planned.task_id.as_str())
                .ok_or_else(|| format!("slot references unknown task {}", planned.task_id))?;
            if planned.start_time >= planned.end_time {
                return Err(format!("slot for task {} does not end after it starts", planned.task_id));
            }
            if !placed.insert(planned.task_id.as_str()) {
                return Err(format!("task {} placed twice", planned.task_id));
            }
            if let Some(score) = planned.suitability_score {
                if !score.is_finite() {
                    return Err(format!("slot for task {} has an invalid score", planned.task_id));
                }
            }

            let start_at = analysis.target_date.and_time(planned.start_time).and_utc();
            let end_at = analysis.target_date.and_time(planned.end_time).and_utc();
            let reminder = planned
                .reminder_minutes_before
                .or(analysis.preferences.reminder_minutes_before)
                .unwrap_or(self.config.default_reminder_minutes)
                .max(0);

            slots.push(OptimizedScheduleSlot {
                id: Uuid::new_v4(),
                analysis_id: analysis.id,
                user_id: analysis.user_id,
                date: analysis.target_date,
                start_at,
                end_at,
                duration_minutes: (end_at - start_at).num_minutes() as i32,
                task_id: task.id.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
                priority: task.priority,
                category: task.category.clone(),
                suitability_score: planned.suitability_score,
                is_flexible: planned.is_flexible,
                reminder_minutes_before: reminder,
                notification_sent: false,
                notification_sent_at: None,
                user_confirmed: false,
                status: SlotStatus::Scheduled,
                source_record_id: task.source_record_id,
                converted_event_id: None,
                created_at: now,
                updated_at: now,
            });
        }

        if let Some(unknown) = plan.unplaced_task_ids.iter().find(|id| !tasks.contains_key(id.as_str())) {
            return Err(format!("unplaced list references unknown task {unknown}"));
        }
        Ok(slots)
    }

    async fn load(&self, analysis_id: Uuid) -> PipelineResult<AiScheduleAnalysis> {
        self.schedule
            .get_analysis(analysis_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("analysis {analysis_id}")))
    }

    pub async fn get_report(&self, analysis_id: Uuid) -> PipelineResult<AnalysisReport> {
        let analysis = self.load(analysis_id).await?;
        let slots = self.schedule.list_slots(analysis_id).await?;
        Ok(AnalysisReport { analysis, slots })
    }

    pub async fn history(&self, user_id: Uuid, date: Option<NaiveDate>) -> PipelineResult<Vec<AiScheduleAnalysis>> {
        Ok(self.schedule.list_analyses(user_id, date).await?)
    }

    /// Most recent completed analysis for the date, with its slots.
    pub async fn latest_completed(&self, user_id: Uuid, date: NaiveDate) -> PipelineResult<Option<AnalysisReport>> {
        let latest = self
            .schedule
            .list_analyses(user_id, Some(date))
            .await?
            .into_iter()
            .find(|a| a.status == AnalysisStatus::Completed);

        match latest {
            Some(analysis) => {
                let slots = self.schedule.list_slots(analysis.id).await?;
                Ok(Some(AnalysisReport { analysis, slots }))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, feedback), fields(analysis_id = %analysis_id))]
    pub async fn record_feedback(
        &self,
        analysis_id: Uuid,
        feedback: &AnalysisFeedback,
    ) -> PipelineResult<AiScheduleAnalysis> {
        if let Some(rating) = feedback.rating {
            if !(1..=5).contains(&rating) {
                return Err(PipelineError::Validation("rating must be between 1 and 5".into()));
            }
        }
        if !self.schedule.record_feedback(analysis_id, feedback, self.clock.now()).await? {
            return Err(PipelineError::NotFound(format!("analysis {analysis_id}")));
        }
        self.load(analysis_id).await
    }

    // ========================================================================
    // Slots
    // ========================================================================

    async fn load_slot(&self, slot_id: Uuid) -> PipelineResult<OptimizedScheduleSlot> {
        self.schedule
            .get_slot(slot_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("slot {slot_id}")))
    }

    pub async fn confirm_slot(&self, slot_id: Uuid) -> PipelineResult<OptimizedScheduleSlot> {
        let slot = self.load_slot(slot_id).await?;
        if !self.schedule.confirm_slot(slot_id, self.clock.now()).await? {
            return Err(PipelineError::Conflict(format!(
                "slot is {} and cannot be confirmed",
                slot.status
            )));
        }
        self.load_slot(slot_id).await
    }

    pub async fn complete_slot(&self, slot_id: Uuid) -> PipelineResult<OptimizedScheduleSlot> {
        self.transition_slot(slot_id, SlotStatus::Completed).await
    }

    pub async fn cancel_slot(&self, slot_id: Uuid) -> PipelineResult<OptimizedScheduleSlot> {
        self.transition_slot(slot_id, SlotStatus::Cancelled).await
    }

    async fn transition_slot(&self, slot_id: Uuid, to: SlotStatus) -> PipelineResult<OptimizedScheduleSlot> {
        let slot = self.load_slot(slot_id).await?;
        if !self.schedule.transition_slot(slot_id, to, self.clock.now()).await? {
            return Err(PipelineError::Conflict(format!("slot is already {}", slot.status)));
        }
        tracing::info!(slot_id = %slot_id, status = %to, "Slot status changed");
        self.load_slot(slot_id).await
    }

    /// Creates the calendar event for a slot. Repeated calls return the same event.
    #[instrument(skip(self), fields(slot_id = %slot_id))]
    pub async fn materialize_slot(&self, slot_id: Uuid) -> PipelineResult<Event> {
        let slot = self.load_slot(slot_id).await?;
        if let Some(event_id) = slot.converted_event_id {
            return self.existing_event(event_id).await;
        }
        if slot.status == SlotStatus::Cancelled {
            return Err(PipelineError::Conflict("cancelled slots cannot become events".into()));
        }

        let mut event = NewEvent::from_slot(&slot).into_event(slot.user_id, EventSource::Optimizer, self.clock.now());
        event.schedule_slot_id = Some(slot.id);

        if self.schedule.materialize_slot_event(slot_id, &event).await? {
            tracing::info!(event_id = %event.id, "Slot materialized");
            return Ok(event);
        }

        // Lost the race; hand back the winner's event
        match self.load_slot(slot_id).await?.converted_event_id {
            Some(event_id) => self.existing_event(event_id).await,
            None => Err(PipelineError::Conflict("slot could not be materialized".into())),
        }
    }

    async fn existing_event(&self, event_id: Uuid) -> PipelineResult<Event> {
        self.events
            .get_event(event_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("event {event_id}")))
    }
}

fn validate_request(tasks: &[TaskInput], preferences: &SchedulePreferences) -> PipelineResult<()> {
    if tasks.is_empty() {
        return Err(PipelineError::Validation("at least one task is required".into()));
    }
    if preferences.work_end <= preferences.work_start {
        return Err(PipelineError::Validation("work_end must be after work_start".into()));
    }
    if preferences.break_minutes < 0 {
        return Err(PipelineError::Validation("break_minutes cannot be negative".into()));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() || task.title.trim().is_empty() {
            return Err(PipelineError::Validation("tasks need an id and a title".into()));
        }
        if task.duration_minutes <= 0 {
            return Err(PipelineError::Validation(format!(
                "task {} needs a positive duration",
                task.id
            )));
        }
        if !ids.insert(task.id.as_str()) {
            return Err(PipelineError::Validation(format!("duplicate task id {}", task.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollaboratorError, StorageError};
    use crate::pipeline::clock::FixedClock;
    use crate::pipeline::collaborators::fakes::{PlanReply, ScriptedOptimizer};
    use crate::pipeline::collaborators::PlannedSlot;
    use crate::domain::Priority;
    use crate::store::memory::Fault;
    use crate::store::MemoryStore;
    use chrono::{NaiveTime, TimeZone};
    use std::time::Duration;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
    }

    fn task(id: &str, minutes: i32) -> TaskInput {
        TaskInput {
            id: id.into(),
            title: format!("Task {id}"),
            description: None,
            duration_minutes: minutes,
            priority: Priority::Medium,
            preferred_time: None,
            category: None,
            source_record_id: None,
        }
    }

    fn slot(task_id: &str, start: NaiveTime, end: NaiveTime) -> PlannedSlot {
        PlannedSlot {
            task_id: task_id.into(),
            start_time: start,
            end_time: end,
            suitability_score: Some(0.8),
            is_flexible: false,
            reminder_minutes_before: None,
        }
    }

    fn plan(slots: Vec<PlannedSlot>, unplaced: &[&str]) -> OptimizationPlan {
        OptimizationPlan {
            slots,
            metrics: serde_json::json!({ "score": 0.9 }),
            unplaced_task_ids: unplaced.iter().map(|s| s.to_string()).collect(),
            raw_payload: serde_json::Value::Null,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        ai: Arc<ScriptedOptimizer>,
        engine: ScheduleOptimizer,
    }

    fn harness(reply: PlanReply) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ai = Arc::new(ScriptedOptimizer::new(reply));
        let clock = Arc::new(FixedClock::at(Utc.with_ymd_and_hms(2024, 3, 7, 18, 0, 0).unwrap()));
        let engine = ScheduleOptimizer::new(
            store.clone(),
            store.clone(),
            ai.clone(),
            clock,
            PipelineConfig {
                ai_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        Harness { store, ai, engine }
    }

    fn user() -> Uuid {
        Uuid::from_u128(7)
    }

    #[tokio::test]
    async fn completed_analysis_persists_every_slot() {
        let h = harness(PlanReply::Ok(plan(
            vec![slot("a", t(9, 0), t(10, 0)), slot("b", t(10, 30), t(11, 0))],
            &[],
        )));

        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60), task("b", 30)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        assert_eq!(analysis.status, AnalysisStatus::Completed);
        let metrics = analysis.metrics.unwrap();
        assert_eq!(metrics.total_scheduled_minutes, 90);
        assert_eq!(metrics.available_minutes, 480);
        assert!((metrics.utilization_rate - 0.1875).abs() < 1e-9);

        let slots = h.store.list_slots(analysis.id).await.unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start_at, Utc.with_ymd_and_hms(2024, 3, 8, 9, 0, 0).unwrap());
        assert_eq!(slots[0].title, "Task a");
        assert_eq!(slots[0].reminder_minutes_before, 15);
    }

    #[tokio::test]
    async fn partial_analysis_keeps_placed_subset() {
        let h = harness(PlanReply::Ok(plan(vec![slot("a", t(9, 0), t(10, 0))], &["b"])));

        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60), task("b", 600)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        assert_eq!(analysis.status, AnalysisStatus::Partial);
        assert_eq!(analysis.unplaced_task_ids, vec!["b".to_string()]);
        let slots = h.store.list_slots(analysis.id).await.unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].task_id, "a");
    }

    #[tokio::test]
    async fn collaborator_failure_creates_no_slots() {
        let h = harness(PlanReply::Err(CollaboratorError::unknown("500")));

        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert!(analysis.error.is_some());
        assert!(h.store.list_slots(analysis.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_marks_analysis_failed() {
        let h = harness(PlanReply::Hang);

        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert!(analysis.error.unwrap().contains("timeout"));
        let stored = h.store.get_analysis(analysis.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AnalysisStatus::Failed);
    }

    #[tokio::test]
    async fn malformed_plan_is_rejected_whole() {
        let h = harness(PlanReply::Ok(plan(
            vec![slot("a", t(9, 0), t(10, 0)), slot("ghost", t(11, 0), t(12, 0))],
            &[],
        )));

        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert!(analysis.error.unwrap().starts_with("bad_response"));
        assert!(h.store.list_slots(analysis.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slot_write_failure_leaves_failed_analysis_without_slots() {
        let h = harness(PlanReply::Ok(plan(vec![slot("a", t(9, 0), t(10, 0))], &[])));
        h.store.set_fault(Fault::SlotWrites, true);

        let err = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Storage(StorageError::Unavailable(_))));

        let analyses = h.store.list_analyses(user(), Some(date())).await.unwrap();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].status, AnalysisStatus::Failed);
        assert!(h.store.list_slots(analyses[0].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_creates_new_analysis_and_keeps_history() {
        let h = harness(PlanReply::Err(CollaboratorError::rate_limited("busy")));
        let failed = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        h.ai.set_reply(PlanReply::Ok(plan(vec![slot("a", t(9, 0), t(10, 0))], &[])));
        let retried = h.engine.retry_analysis(failed.id).await.unwrap();
        assert_ne!(retried.id, failed.id);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.retried_from, Some(failed.id));
        assert_eq!(retried.status, AnalysisStatus::Completed);

        assert_eq!(h.engine.history(user(), Some(date())).await.unwrap().len(), 2);
        let original = h.store.get_analysis(failed.id).await.unwrap().unwrap();
        assert_eq!(original.status, AnalysisStatus::Failed);

        assert!(matches!(
            h.engine.retry_analysis(retried.id).await,
            Err(PipelineError::Conflict(_))
        ));

        let latest = h.engine.latest_completed(user(), date()).await.unwrap().unwrap();
        assert_eq!(latest.analysis.id, retried.id);
        assert_eq!(latest.slots.len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_persisting() {
        let h = harness(PlanReply::Hang);
        let inverted = SchedulePreferences {
            work_start: t(17, 0),
            work_end: t(9, 0),
            ..Default::default()
        };

        for (tasks, prefs) in [
            (vec![], SchedulePreferences::default()),
            (vec![task("a", 0)], SchedulePreferences::default()),
            (vec![task("a", 30), task("a", 30)], SchedulePreferences::default()),
            (vec![task("a", 30)], inverted),
        ] {
            assert!(matches!(
                h.engine.optimize(user(), tasks, prefs, date()).await,
                Err(PipelineError::Validation(_))
            ));
        }
        assert!(h.store.list_analyses(user(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn feedback_rating_is_bounded() {
        let h = harness(PlanReply::Ok(plan(vec![slot("a", t(9, 0), t(10, 0))], &[])));
        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();

        let bad = AnalysisFeedback {
            approved: true,
            rating: Some(6),
        };
        assert!(matches!(
            h.engine.record_feedback(analysis.id, &bad).await,
            Err(PipelineError::Validation(_))
        ));

        let good = AnalysisFeedback {
            approved: true,
            rating: Some(4),
        };
        let updated = h.engine.record_feedback(analysis.id, &good).await.unwrap();
        assert_eq!(updated.user_approved, Some(true));
        assert_eq!(updated.user_rating, Some(4));
    }

    #[tokio::test]
    async fn slot_lifecycle_and_single_materialization() {
        let h = harness(PlanReply::Ok(plan(
            vec![slot("a", t(9, 0), t(10, 0)), slot("b", t(11, 0), t(12, 0))],
            &[],
        )));
        let analysis = h
            .engine
            .optimize(user(), vec![task("a", 60), task("b", 60)], SchedulePreferences::default(), date())
            .await
            .unwrap();
        let slots = h.store.list_slots(analysis.id).await.unwrap();

        let confirmed = h.engine.confirm_slot(slots[0].id).await.unwrap();
        assert!(confirmed.user_confirmed);

        let first = h.engine.materialize_slot(slots[0].id).await.unwrap();
        let second = h.engine.materialize_slot(slots[0].id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.schedule_slot_id, Some(slots[0].id));
        assert_eq!(h.store.event_count(), 1);

        let cancelled = h.engine.cancel_slot(slots[1].id).await.unwrap();
        assert_eq!(cancelled.status, SlotStatus::Cancelled);
        assert!(matches!(
            h.engine.complete_slot(slots[1].id).await,
            Err(PipelineError::Conflict(_))
        ));
        assert!(matches!(
            h.engine.materialize_slot(slots[1].id).await,
            Err(PipelineError::Conflict(_))
        ));
    }
}
