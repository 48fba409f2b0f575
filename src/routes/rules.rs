//! Parsing rule management

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{Created, DataResponse, MessageResponse};
use crate::app::AppState;
use crate::domain::{ParsingRuleInput, ParsingRuleResponse};
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentUser;
use crate::pipeline::parsing;

#[derive(Debug, Deserialize)]
pub struct RuleScope {
    pub profession: Option<String>,
}

/// Active rules that apply to a profession (global rules always included)
pub async fn list_rules(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Query(scope): Query<RuleScope>,
) -> ApiResult<impl IntoResponse> {
    let profession = scope.profession.map(|p| p.trim().to_lowercase());
    let rules: Vec<ParsingRuleResponse> = state
        .rules
        .active_rules(profession.as_deref())
        .await?
        .into_iter()
        .map(ParsingRuleResponse::from)
        .collect();
    Ok(DataResponse::new(rules))
}

pub async fn create_rule(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ParsingRuleInput>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("rule name is required"));
    }
    parsing::compile(&req.pattern).map_err(|e| ApiError::bad_request(format!("invalid pattern: {e}")))?;
    if req.action.assign.is_empty() {
        return Err(ApiError::bad_request("rule must assign at least one field"));
    }

    let rule = req.into_rule(state.clock.now());
    state.rules.insert_rule(&rule).await?;

    tracing::info!(
        user_id = %user.id(),
        rule_id = %rule.id,
        profession = ?rule.profession,
        "Parsing rule created"
    );
    Ok(Created(ParsingRuleResponse::from(rule)))
}

async fn set_active(state: &AppState, rule_id: Uuid, active: bool) -> ApiResult<MessageResponse> {
    if !state.rules.set_rule_active(rule_id, active).await? {
        return Err(ApiError::not_found(format!("rule {rule_id} not found")));
    }
    tracing::info!(rule_id = %rule_id, active, "Parsing rule toggled");

    Ok(if active {
        MessageResponse::with_code("Rule activated", "RULE_ACTIVATED")
    } else {
        MessageResponse::with_code("Rule deactivated", "RULE_DEACTIVATED")
    })
}

pub async fn activate_rule(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    set_active(&state, rule_id, true).await
}

pub async fn deactivate_rule(
    _user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    set_active(&state, rule_id, false).await
}
