//! Slot reminders
//!
//! Polling model: selecting due slots never mutates anything; only
//! `mark_sent` does, and only once per slot. A dispatcher delivers first and
//! marks after, so a failed delivery is simply picked up by the next poll.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;

use super::clock::Clock;
use crate::domain::OptimizedScheduleSlot;
use crate::error::{PipelineResult, StorageError};
use crate::store::ScheduleStore;

/// Slots handled per poll
const DISPATCH_BATCH: i64 = 200;

/// Delivers one reminder. Must not mark the slot itself.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(&self, slot: &OptimizedScheduleSlot) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub due: usize,
    pub sent: usize,
    /// Delivered, but another dispatcher marked the slot first
    pub already_sent: usize,
    pub failed: usize,
    /// Delivered, but the sent flag could not be stored; redelivered next poll
    pub unmarked: usize,
}

pub struct NotificationScheduler {
    schedule: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationScheduler {
    pub fn new(schedule: Arc<dyn ScheduleStore>, clock: Arc<dyn Clock>) -> Self {
        Self { schedule, clock }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Scheduled, unsent slots whose reminder time has been reached.
    pub async fn due_notifications(&self, now: chrono::DateTime<chrono::Utc>) -> PipelineResult<Vec<OptimizedScheduleSlot>> {
        Ok(self.schedule.due_slots(now, DISPATCH_BATCH).await?)
    }

    /// True only for the call that actually flipped the flag.
    pub async fn mark_sent(&self, slot_id: Uuid) -> PipelineResult<bool> {
        Ok(self.schedule.mark_slot_notified(slot_id, self.clock.now()).await?)
    }

    #[instrument(skip_all)]
    pub async fn dispatch_due(&self, sink: &dyn ReminderSink) -> PipelineResult<DispatchSummary> {
        let due = self.due_notifications(self.clock.now()).await?;
        let mut summary = DispatchSummary {
            due: due.len(),
            ..Default::default()
        };

        for slot in &due {
            if let Err(e) = sink.deliver(slot).await {
                tracing::warn!(slot_id = %slot.id, error = %e, "Reminder delivery failed, will retry next poll");
                summary.failed += 1;
                continue;
            }
            match self.mark_sent(slot.id).await {
                Ok(true) => summary.sent += 1,
                Ok(false) => {
                    tracing::info!(slot_id = %slot.id, "Reminder already marked sent by another dispatcher");
                    summary.already_sent += 1;
                }
                Err(e) => {
                    tracing::error!(slot_id = %slot.id, error = %e, "Reminder delivered but not marked sent");
                    summary.unmarked += 1;
                }
            }
        }

        if summary.due > 0 {
            tracing::info!(
                due = summary.due,
                sent = summary.sent,
                already_sent = summary.already_sent,
                failed = summary.failed,
                unmarked = summary.unmarked,
                "Reminder dispatch finished"
            );
        }
        Ok(summary)
    }

    /// Polls for due reminders every `every` until the task is aborted.
    pub fn spawn_dispatcher(self: Arc<Self>, sink: Arc<dyn ReminderSink>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.dispatch_due(sink.as_ref()).await {
                    tracing::error!(error = %e, "Reminder dispatch failed");
                }
            }
        })
    }
}
