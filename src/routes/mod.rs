pub mod events;
pub mod health;
pub mod imports;
pub mod rules;
pub mod schedule;

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentUser;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        // Import batches
        .route("/imports", post(imports::create_batch).get(imports::list_batches))
        .route("/imports/:batch_id", get(imports::get_batch))
        .route("/imports/:batch_id/records", get(imports::list_records))
        .route("/imports/:batch_id/process", post(imports::process_batch))
        .route("/imports/:batch_id/convert", post(imports::convert_batch))
        .route("/imports/:batch_id/retry", post(imports::retry_failed))
        // Records
        .route("/records/:record_id", get(imports::get_record))
        .route("/records/:record_id/review", patch(imports::review_record))
        // Events
        .route("/events", post(events::create_event).get(events::list_events))
        .route("/events/:event_id", get(events::get_event))
        .route("/events/:event_id/analyze", post(events::analyze_event))
        .route("/events/:event_id/analysis/reset", post(events::reset_event_analysis))
        // Parsing rules
        .route("/parsing-rules", get(rules::list_rules).post(rules::create_rule))
        .route("/parsing-rules/:rule_id/activate", post(rules::activate_rule))
        .route("/parsing-rules/:rule_id/deactivate", post(rules::deactivate_rule))
        // Schedule optimization
        .route("/schedule/optimize", post(schedule::optimize))
        .route("/schedule/latest", get(schedule::latest_completed))
        .route("/schedule/analyses", get(schedule::list_analyses))
        .route("/schedule/analyses/:analysis_id", get(schedule::get_analysis))
        .route("/schedule/analyses/:analysis_id/feedback", post(schedule::record_feedback))
        .route("/schedule/analyses/:analysis_id/retry", post(schedule::retry_analysis))
        // Slots
        .route("/schedule/slots/:slot_id/confirm", post(schedule::confirm_slot))
        .route("/schedule/slots/:slot_id/complete", post(schedule::complete_slot))
        .route("/schedule/slots/:slot_id/cancel", post(schedule::cancel_slot))
        .route("/schedule/slots/:slot_id/materialize", post(schedule::materialize_slot))
        .route("/schedule/slots/:slot_id/notification-sent", post(schedule::mark_notification_sent))
        // Reminders
        .route("/schedule/notifications/due", get(schedule::due_notifications))
}

/// Resources of other users are reported as missing.
pub(crate) fn ensure_owner(user: CurrentUser, owner_id: Uuid, what: &str, id: Uuid) -> ApiResult<()> {
    if user.id() == owner_id {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("{what} {id} not found")))
    }
}
