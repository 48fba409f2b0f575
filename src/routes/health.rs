use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

use crate::app::AppState;
use crate::db;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceHealth,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub database: &'static str,
    pub redis: &'static str,
    pub ai_service: &'static str,
}

/// Probe outcome; `None` when the service is not configured
async fn probe<F>(check: Option<F>) -> Option<bool>
where
    F: Future<Output = bool>,
{
    match check {
        Some(check) => Some(check.await),
        None => None,
    }
}

fn label(result: Option<bool>) -> &'static str {
    match result {
        Some(true) => "ok",
        Some(false) => "error",
        None => "disabled",
    }
}

/// Health check endpoint - public
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    // Check all services in parallel
    let (db_result, redis_result, ai_result) = tokio::join!(
        probe(state.db.as_ref().map(db::health_check)),
        probe(state.cache.as_ref().map(|cache| async move { cache.health_check().await.is_ok() })),
        probe(state.ai_client.as_ref().map(|ai| async move { ai.health_check().await.is_ok() })),
    );

    let db_ok = db_result != Some(false);
    let status = if db_ok && redis_result != Some(false) && ai_result != Some(false) {
        "healthy"
    } else if db_ok {
        // Records can still be stored; analysis or caching is impaired
        "degraded"
    } else {
        "unhealthy"
    };

    let status_code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            services: ServiceHealth {
                database: label(db_result),
                redis: label(redis_result),
                ai_service: label(ai_result),
            },
        }),
    )
}
