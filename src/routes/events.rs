use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::ensure_owner;
use crate::api::{Created, DataResponse};
use crate::app::AppState;
use crate::domain::{Event, EventSource, NewEvent};
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentUser;

async fn owned_event(state: &AppState, user: CurrentUser, event_id: Uuid) -> ApiResult<Event> {
    let event = state
        .events
        .get_event(event_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("event {event_id} not found")))?;
    ensure_owner(user, event.user_id, "event", event_id)?;
    Ok(event)
}

/// Create a manual event
pub async fn create_event(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewEvent>,
) -> ApiResult<impl IntoResponse> {
    req.validate()?;
    let event = req.into_event(user.id(), EventSource::Manual, state.clock.now());
    state.events.insert_event(&event).await?;

    tracing::info!(user_id = %user.id(), event_id = %event.id, "Event created");
    Ok(Created(event))
}

#[derive(Debug, Deserialize)]
pub struct EventRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// List the caller's events, optionally those starting within `[from, to)`
pub async fn list_events(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Query(range): Query<EventRange>,
) -> ApiResult<impl IntoResponse> {
    if let (Some(from), Some(to)) = (range.from, range.to) {
        if to <= from {
            return Err(ApiError::bad_request("`to` must be after `from`"));
        }
    }
    let events = state.events.list_events(user.id(), range.from, range.to).await?;
    Ok(DataResponse::new(events))
}

pub async fn get_event(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(DataResponse::new(owned_event(&state, user, event_id).await?))
}

/// Run AI analysis for one event. A failed analysis still returns 200 with
/// the event in `failed` state.
pub async fn analyze_event(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_event(&state, user, event_id).await?;
    let event = state.event_analysis.analyze_event(event_id).await?;
    Ok(DataResponse::new(event))
}

pub async fn reset_event_analysis(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_event(&state, user, event_id).await?;
    let event = state.event_analysis.reset_event_analysis(event_id).await?;
    Ok(DataResponse::new(event))
}
