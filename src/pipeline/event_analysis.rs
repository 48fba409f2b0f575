//! AI re-analysis of existing events
//!
//! Claiming flips the event to `in_progress` and sets its lock in one
//! conditional update. The claim is always settled: completed analyses keep
//! the lock until reset, failures release it.

use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::clock::Clock;
use super::collaborators::{call_with_timeout, AnalysisContext, TextAnalyzer};
use super::PipelineConfig;
use crate::domain::{AiAnalysisBlock, Event, ParsedFields};
use crate::error::{PipelineError, PipelineResult};
use crate::store::EventStore;

pub struct EventAnalysis {
    events: Arc<dyn EventStore>,
    analyzer: Arc<dyn TextAnalyzer>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl EventAnalysis {
    pub fn new(
        events: Arc<dyn EventStore>,
        analyzer: Arc<dyn TextAnalyzer>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            events,
            analyzer,
            clock,
            config,
        }
    }

    /// Runs one analysis. A collaborator failure is recorded on the event and
    /// returned as a failed event rather than an error.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn analyze_event(&self, event_id: Uuid) -> PipelineResult<Event> {
        let current = self
            .events
            .get_event(event_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("event {event_id}")))?;
        if !current.can_claim_analysis() {
            return Err(PipelineError::Conflict(
                "event analysis is running or already completed".into(),
            ));
        }

        // The claim is still the arbiter when two callers race past the check
        let claim_id = Uuid::new_v4();
        let Some(event) = self
            .events
            .claim_ai_analysis(event_id, claim_id, self.clock.now())
            .await?
        else {
            return Err(PipelineError::Conflict(
                "event analysis is running or already completed".into(),
            ));
        };

        let context = AnalysisContext {
            profession: None,
            hints: ParsedFields {
                title: Some(event.title.clone()),
                category: event.category.clone(),
                priority: event.priority,
                ..Default::default()
            },
            keywords: Vec::new(),
        };
        let text = event.analysis_text();
        let reply = call_with_timeout(self.config.ai_timeout, self.analyzer.analyze(&text, &context))
            .await
            .and_then(|analysis| analysis.validate());

        let now = self.clock.now();
        let next = match reply {
            Ok(analysis) => {
                tracing::info!(confidence = analysis.confidence, "Event analyzed");
                event.analysis_completed(
                    AiAnalysisBlock {
                        confidence: analysis.confidence,
                        category: analysis.category.or(analysis.fields.category),
                        importance: analysis.importance.or(analysis.fields.priority),
                        raw_payload: analysis.raw_payload,
                        analyzed_at: now,
                    },
                    now,
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "Event analysis failed");
                event.analysis_failed(&e.to_string(), now)
            }
        };

        if !self.events.finish_ai_analysis(&next, claim_id).await? {
            return Err(PipelineError::Conflict("event analysis was reset concurrently".into()));
        }
        Ok(next)
    }

    /// Clears the analysis state so the event can be analyzed again.
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn reset_event_analysis(&self, event_id: Uuid) -> PipelineResult<Event> {
        if !self.events.reset_ai_analysis(event_id, self.clock.now()).await? {
            return Err(PipelineError::NotFound(format!("event {event_id}")));
        }
        self.events
            .get_event(event_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("event {event_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventAiStatus, EventSource, NewEvent, Priority};
    use crate::error::CollaboratorError;
    use crate::pipeline::clock::FixedClock;
    use crate::pipeline::collaborators::fakes::{Reply, ScriptedAnalyzer};
    use crate::pipeline::collaborators::TextAnalysis;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    async fn setup(reply: Reply) -> (Arc<MemoryStore>, EventAnalysis, Event) {
        let store = Arc::new(MemoryStore::new());
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();
        let event = NewEvent {
            title: "Budget review".into(),
            description: None,
            start_at: None,
            end_at: None,
            location: None,
            priority: None,
            category: None,
        }
        .into_event(uuid::Uuid::new_v4(), EventSource::Manual, now);
        store.insert_event(&event).await.unwrap();

        let analyzer = ScriptedAnalyzer::new().reply("Budget review", reply);
        let engine = EventAnalysis::new(
            store.clone(),
            Arc::new(analyzer),
            Arc::new(FixedClock::at(now)),
            PipelineConfig {
                ai_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        (store, engine, event)
    }

    #[tokio::test]
    async fn completed_analysis_keeps_lock_until_reset() {
        let (_store, engine, event) = setup(Reply::Ok(TextAnalysis {
            fields: ParsedFields::default(),
            confidence: 0.85,
            category: Some("finance".into()),
            importance: Some(Priority::High),
            raw_payload: serde_json::json!({}),
        }))
        .await;

        let analyzed = engine.analyze_event(event.id).await.unwrap();
        assert_eq!(analyzed.ai_status, EventAiStatus::Completed);
        assert!(analyzed.ai_locked);
        assert_eq!(analyzed.category.as_deref(), Some("finance"));

        assert!(matches!(
            engine.analyze_event(event.id).await,
            Err(PipelineError::Conflict(_))
        ));

        let reset = engine.reset_event_analysis(event.id).await.unwrap();
        assert_eq!(reset.ai_status, EventAiStatus::Pending);
        assert!(!reset.ai_locked);
    }

    #[tokio::test]
    async fn failure_releases_the_lock() {
        let (store, engine, event) = setup(Reply::Err(CollaboratorError::bad_response("garbage"))).await;

        let failed = engine.analyze_event(event.id).await.unwrap();
        assert_eq!(failed.ai_status, EventAiStatus::Failed);
        assert!(!failed.ai_locked);
        assert!(failed.ai_error.unwrap().contains("bad_response"));

        // Failed events can be claimed again
        assert!(store
            .claim_ai_analysis(event.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn timeout_does_not_leave_event_in_progress() {
        let (store, engine, event) = setup(Reply::Hang).await;

        engine.analyze_event(event.id).await.unwrap();
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.ai_status, EventAiStatus::Failed);
        assert!(!stored.ai_locked);
    }

    #[tokio::test]
    async fn stale_run_cannot_finish_after_reset_and_reclaim() {
        let (store, engine, event) = setup(Reply::Hang).await;
        let now = Utc::now();

        let (run_a, run_b) = (Uuid::new_v4(), Uuid::new_v4());
        let claimed_a = store.claim_ai_analysis(event.id, run_a, now).await.unwrap().unwrap();
        engine.reset_event_analysis(event.id).await.unwrap();
        let claimed_b = store.claim_ai_analysis(event.id, run_b, now).await.unwrap().unwrap();

        let stale = claimed_a.analysis_failed("late reply", now);
        assert!(!store.finish_ai_analysis(&stale, run_a).await.unwrap());

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.ai_status, EventAiStatus::InProgress);
        assert!(stored.ai_locked);
        assert_eq!(stored.ai_claim_id, Some(run_b));

        let live = claimed_b.analysis_failed("own reply", now);
        assert!(store.finish_ai_analysis(&live, run_b).await.unwrap());
        let stored = store.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.ai_error.as_deref(), Some("own reply"));
        assert_eq!(stored.ai_claim_id, None);
    }

    #[tokio::test]
    async fn unknown_event_is_not_found() {
        let (_store, engine, _event) = setup(Reply::Hang).await;
        assert!(matches!(
            engine.analyze_event(Uuid::new_v4()).await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
