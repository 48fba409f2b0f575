//! Schedule optimization, slot lifecycle and reminder endpoints

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::ensure_owner;
use crate::api::{ApiResponse, Created, DataResponse, MessageResponse};
use crate::app::AppState;
use crate::domain::{AnalysisFeedback, AnalysisReport, OptimizedScheduleSlot, SchedulePreferences, TaskInput};
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentUser;

async fn owned_report(state: &AppState, user: CurrentUser, analysis_id: Uuid) -> ApiResult<AnalysisReport> {
    let report = state.optimizer.get_report(analysis_id).await?;
    ensure_owner(user, report.analysis.user_id, "analysis", analysis_id)?;
    Ok(report)
}

async fn owned_slot(state: &AppState, user: CurrentUser, slot_id: Uuid) -> ApiResult<OptimizedScheduleSlot> {
    let slot = state
        .schedule
        .get_slot(slot_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("slot {slot_id} not found")))?;
    ensure_owner(user, slot.user_id, "slot", slot_id)?;
    Ok(slot)
}

// ============================================================================
// Analyses
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OptimizeRequest {
    pub tasks: Vec<TaskInput>,
    #[serde(default)]
    pub preferences: SchedulePreferences,
    pub target_date: NaiveDate,
}

/// Run a new optimization. The analysis is created even when the optimizer
/// fails; its status tells the outcome.
pub async fn optimize(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<OptimizeRequest>,
) -> ApiResult<impl IntoResponse> {
    let analysis = state
        .optimizer
        .optimize(user.id(), req.tasks, req.preferences, req.target_date)
        .await?;
    let report = state.optimizer.get_report(analysis.id).await?;
    Ok(Created(report))
}

#[derive(Debug, Deserialize)]
pub struct DateFilter {
    pub date: Option<NaiveDate>,
}

/// Analysis history, newest first
pub async fn list_analyses(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DateFilter>,
) -> ApiResult<impl IntoResponse> {
    let analyses = state.optimizer.history(user.id(), filter.date).await?;
    Ok(DataResponse::new(analyses))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub date: NaiveDate,
}

pub async fn latest_completed(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .optimizer
        .latest_completed(user.id(), query.date)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no completed analysis for {}", query.date)))?;
    Ok(DataResponse::new(report))
}

pub async fn get_analysis(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(analysis_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(DataResponse::new(owned_report(&state, user, analysis_id).await?))
}

pub async fn record_feedback(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(analysis_id): Path<Uuid>,
    Json(feedback): Json<AnalysisFeedback>,
) -> ApiResult<impl IntoResponse> {
    owned_report(&state, user, analysis_id).await?;
    let analysis = state.optimizer.record_feedback(analysis_id, &feedback).await?;
    Ok(DataResponse::new(analysis))
}

/// Re-run a failed or partial analysis as a new analysis
pub async fn retry_analysis(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(analysis_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_report(&state, user, analysis_id).await?;
    let analysis = state.optimizer.retry_analysis(analysis_id).await?;
    let report = state.optimizer.get_report(analysis.id).await?;
    Ok(Created(report))
}

// ============================================================================
// Slots
// ============================================================================

pub async fn confirm_slot(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_slot(&state, user, slot_id).await?;
    Ok(DataResponse::new(state.optimizer.confirm_slot(slot_id).await?))
}

pub async fn complete_slot(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_slot(&state, user, slot_id).await?;
    Ok(DataResponse::new(state.optimizer.complete_slot(slot_id).await?))
}

pub async fn cancel_slot(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_slot(&state, user, slot_id).await?;
    Ok(DataResponse::new(state.optimizer.cancel_slot(slot_id).await?))
}

/// Create (or return the already created) calendar event for a slot
pub async fn materialize_slot(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_slot(&state, user, slot_id).await?;
    Ok(DataResponse::new(state.optimizer.materialize_slot(slot_id).await?))
}

// ============================================================================
// Reminders
// ============================================================================

/// The caller's slots whose reminder is due now. Read-only.
pub async fn due_notifications(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let now = state.reminders.now();
    let due: Vec<OptimizedScheduleSlot> = state
        .reminders
        .due_notifications(now)
        .await?
        .into_iter()
        .filter(|slot| slot.user_id == user.id())
        .collect();

    Ok(ApiResponse::with_meta(due, serde_json::json!({ "as_of": now })))
}

/// Record that the caller's client delivered a reminder
pub async fn mark_notification_sent(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(slot_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_slot(&state, user, slot_id).await?;

    let response = if state.reminders.mark_sent(slot_id).await? {
        MessageResponse::with_code("Reminder marked as sent", "SENT")
    } else {
        tracing::info!(slot_id = %slot_id, "Reminder was already marked sent");
        MessageResponse::with_code("Reminder was already sent", "ALREADY_SENT")
    };
    Ok(response)
}
