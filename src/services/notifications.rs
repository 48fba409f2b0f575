//! In-app reminder notifications
//!
//! Writes one row into `notifications` per delivered slot reminder. Transient
//! database errors are retried with exponential backoff before the delivery
//! is reported as failed.

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::OptimizedScheduleSlot;
use crate::error::StorageError;
use crate::pipeline::ReminderSink;

const NOTIFICATION_TYPE: &str = "schedule_reminder";

/// Reminder sink backed by the notifications table.
#[derive(Clone)]
pub struct InAppReminderSink {
    db: PgPool,
    max_elapsed: Duration,
}

impl InAppReminderSink {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            max_elapsed: Duration::from_secs(10),
        }
    }

    async fn insert(&self, id: Uuid, slot: &OptimizedScheduleSlot) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, type, title, message, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(slot.user_id)
        .bind(NOTIFICATION_TYPE)
        .bind(format!("Upcoming: {}", slot.title))
        .bind(reminder_message(slot))
        .bind(serde_json::json!({
            "slot_id": slot.id,
            "analysis_id": slot.analysis_id,
            "task_id": slot.task_id,
            "start_at": slot.start_at,
        }))
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Connection trouble, lock conflicts and resource pressure are worth another
/// attempt; constraint violations and bad data are not.
fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Protocol(_) => true,
        sqlx::Error::Database(db) => db.code().map_or(false, |code| {
            // 08: connection exception, 40: serialization failure / deadlock,
            // 53: insufficient resources, 57P0x: server shutting down
            code.starts_with("08") || code.starts_with("40") || code.starts_with("53") || code.starts_with("57P0")
        }),
        _ => false,
    }
}

fn reminder_message(slot: &OptimizedScheduleSlot) -> String {
    format!(
        "{} starts at {} ({} min)",
        slot.title,
        slot.start_at.format("%H:%M UTC"),
        slot.duration_minutes
    )
}

#[async_trait]
impl ReminderSink for InAppReminderSink {
    async fn deliver(&self, slot: &OptimizedScheduleSlot) -> Result<(), StorageError> {
        // Same id on every attempt so a retried insert cannot duplicate the row
        let id = Uuid::new_v4();
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        backoff::future::retry(policy, || async move {
            self.insert(id, slot).await.map_err(|e| {
                if is_transient(&e) {
                    tracing::debug!(slot_id = %slot.id, error = %e, "Notification insert failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await?;

        tracing::info!(
            user_id = %slot.user_id,
            slot_id = %slot.id,
            notification_type = NOTIFICATION_TYPE,
            notification_id = %id,
            "Notification created"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, SlotStatus};
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn message_mentions_start_time() {
        let start = Utc.with_ymd_and_hms(2024, 3, 8, 9, 30, 0).unwrap();
        let slot = OptimizedScheduleSlot {
            id: Uuid::new_v4(),
            analysis_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            start_at: start,
            end_at: start + chrono::Duration::minutes(45),
            duration_minutes: 45,
            task_id: "t1".into(),
            title: "Client call".into(),
            description: None,
            priority: Priority::High,
            category: None,
            suitability_score: None,
            is_flexible: false,
            reminder_minutes_before: 15,
            notification_sent: false,
            notification_sent_at: None,
            user_confirmed: false,
            status: SlotStatus::Scheduled,
            source_record_id: None,
            converted_event_id: None,
            created_at: start,
            updated_at: start,
        };

        assert_eq!(reminder_message(&slot), "Client call starts at 09:30 UTC (45 min)");
    }

    #[test]
    fn only_connection_level_errors_are_retried() {
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
        assert!(is_transient(&sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer"
        ))));
        assert!(!is_transient(&sqlx::Error::RowNotFound));
        assert!(!is_transient(&sqlx::Error::PoolClosed));
        assert!(!is_transient(&sqlx::Error::ColumnNotFound("title".into())));
    }
}
