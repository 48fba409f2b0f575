//! Import batch and record endpoints

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::ensure_owner;
use crate::api::{ApiResponse, Created, DataResponse, Paginated, PaginationParams};
use crate::app::AppState;
use crate::domain::{BatchProgress, ImportBatch, NewImportBatch, ProcessingStatus, Record, RecordReviewInput};
use crate::error::{ApiError, ApiResult};
use crate::middleware::CurrentUser;
use crate::pipeline::{ConvertOptions, ProcessOptions};
use crate::store::RecordQuery;

async fn owned_batch(state: &AppState, user: CurrentUser, batch_id: Uuid) -> ApiResult<ImportBatch> {
    let batch = state
        .imports
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("batch {batch_id} not found")))?;
    ensure_owner(user, batch.user_id, "batch", batch_id)?;
    Ok(batch)
}

async fn owned_record(state: &AppState, user: CurrentUser, record_id: Uuid) -> ApiResult<Record> {
    let record = state
        .imports
        .get_record(record_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("record {record_id} not found")))?;
    owned_batch(state, user, record.batch_id)
        .await
        .map_err(|_| ApiError::not_found(format!("record {record_id} not found")))?;
    Ok(record)
}

// ============================================================================
// Batches
// ============================================================================

/// Create a batch and its records from raw rows or pasted text
pub async fn create_batch(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewImportBatch>,
) -> ApiResult<impl IntoResponse> {
    let (batch, records) = req.build(user.id(), state.clock.now());
    if records.is_empty() {
        return Err(ApiError::bad_request("import contains no rows"));
    }

    state.imports.insert_batch(&batch, &records).await?;

    tracing::info!(
        user_id = %user.id(),
        batch_id = %batch.id,
        records = records.len(),
        source_kind = ?batch.source_kind,
        "Import batch created"
    );

    Ok(Created(batch))
}

pub async fn list_batches(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Query(pagination): Query<PaginationParams>,
) -> ApiResult<impl IntoResponse> {
    let batches = state
        .imports
        .list_batches(user.id(), pagination.limit(), pagination.offset())
        .await?;

    Ok(ApiResponse::with_meta(
        batches,
        serde_json::json!({ "page": pagination.page(), "per_page": pagination.per_page() }),
    ))
}

#[derive(Debug, Serialize)]
pub struct BatchDetail {
    #[serde(flatten)]
    pub batch: ImportBatch,
    pub progress: BatchProgress,
}

pub async fn get_batch(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let batch = owned_batch(&state, user, batch_id).await?;
    let progress = state.imports.batch_progress(batch_id).await?;
    Ok(DataResponse::new(BatchDetail { batch, progress }))
}

#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    pub status: Option<ProcessingStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

pub async fn list_records(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<RecordListQuery>,
) -> ApiResult<impl IntoResponse> {
    owned_batch(&state, user, batch_id).await?;

    let pagination = PaginationParams {
        page: query.page,
        per_page: query.per_page,
    };
    let records = state
        .imports
        .list_records(&RecordQuery {
            batch_id,
            statuses: query.status.into_iter().collect(),
            record_ids: None,
            limit: Some(pagination.limit()),
            offset: pagination.offset(),
        })
        .await?;

    let progress = state.imports.batch_progress(batch_id).await?;
    let total = match query.status {
        Some(status) => progress.count(status),
        None => progress.total(),
    };

    Ok(Paginated::new(records, &pagination, total.max(0) as u64))
}

// ============================================================================
// Pipeline triggers
// ============================================================================

/// Run AI analysis over the batch's unprocessed records
pub async fn process_batch(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
    Json(options): Json<ProcessOptions>,
) -> ApiResult<impl IntoResponse> {
    owned_batch(&state, user, batch_id).await?;
    let result = state.analysis.process_batch(batch_id, &options).await?;
    Ok(DataResponse::new(result))
}

/// Turn confident parsed records into calendar events
pub async fn convert_batch(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
    Json(options): Json<ConvertOptions>,
) -> ApiResult<impl IntoResponse> {
    owned_batch(&state, user, batch_id).await?;
    let result = state.conversion.convert(batch_id, &options).await?;
    Ok(DataResponse::new(result))
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub reset: u64,
    pub batch: ImportBatch,
}

/// Put failed records back in the queue
pub async fn retry_failed(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    owned_batch(&state, user, batch_id).await?;
    let reset = state.analysis.retry_failed(batch_id).await?;
    let batch = owned_batch(&state, user, batch_id).await?;
    Ok(DataResponse::new(RetryResponse { reset, batch }))
}

// ============================================================================
// Records
// ============================================================================

pub async fn get_record(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let record = owned_record(&state, user, record_id).await?;
    Ok(DataResponse::new(record))
}

pub async fn review_record(
    user: CurrentUser,
    State(state): State<Arc<AppState>>,
    Path(record_id): Path<Uuid>,
    Json(input): Json<RecordReviewInput>,
) -> ApiResult<impl IntoResponse> {
    owned_record(&state, user, record_id).await?;
    let record = state.analysis.review_record(record_id, &input).await?;

    tracing::info!(user_id = %user.id(), record_id = %record_id, "Record reviewed");
    Ok(DataResponse::new(record))
}

#[cfg(test)]
mod tests {
    use crate::app::testing::test_app;
    use crate::domain::ParsedFields;
    use crate::pipeline::collaborators::fakes::{analysis, Reply};
    use axum::http::StatusCode;
    use serde_json::json;
    use uuid::Uuid;

    fn manual_batch() -> serde_json::Value {
        json!({
            "source_kind": "manual_text",
            "format": "text",
            "raw_content": "Team meeting\n\n   \nDentist appointment\n"
        })
    }

    #[tokio::test]
    async fn requires_caller_identity() {
        let app = test_app();

        let (status, body) = app.send("GET", "/imports", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let (status, _) = app.send("GET", "/imports", Some(Uuid::nil()), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_text_becomes_one_record_per_line() {
        let app = test_app();
        let user = Uuid::new_v4();

        let (status, body) = app.send("POST", "/imports", Some(user), Some(manual_batch())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["total_found"], 2);
        assert_eq!(body["data"]["status"], "pending");

        let batch_id = body["data"]["id"].as_str().unwrap().to_string();
        let (status, body) = app
            .send("GET", &format!("/imports/{batch_id}/records?per_page=1"), Some(user), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["raw_text"], "Team meeting");
        assert_eq!(body["pagination"]["total_items"], 2);
        assert_eq!(body["pagination"]["has_next"], true);
    }

    #[tokio::test]
    async fn empty_import_is_rejected() {
        let app = test_app();
        let (status, body) = app
            .send(
                "POST",
                "/imports",
                Some(Uuid::new_v4()),
                Some(json!({ "source_kind": "manual_text", "format": "text", "raw_content": "  \n" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn other_users_batches_are_hidden() {
        let app = test_app();
        let owner = Uuid::new_v4();
        let (_, body) = app.send("POST", "/imports", Some(owner), Some(manual_batch())).await;
        let batch_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .send("GET", &format!("/imports/{batch_id}"), Some(Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app
            .send("POST", &format!("/imports/{batch_id}/process"), Some(Uuid::new_v4()), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn process_then_convert_through_the_api() {
        let app = test_app();
        let user = Uuid::new_v4();
        app.analyzer.set_reply(
            "Team meeting",
            Reply::Ok(analysis(
                0.9,
                ParsedFields {
                    title: Some("Team meeting".into()),
                    ..Default::default()
                },
            )),
        );
        app.analyzer.set_reply(
            "Dentist appointment",
            Reply::Ok(analysis(
                0.5,
                ParsedFields {
                    title: Some("Dentist".into()),
                    ..Default::default()
                },
            )),
        );

        let (_, body) = app.send("POST", "/imports", Some(user), Some(manual_batch())).await;
        let batch_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .send("POST", &format!("/imports/{batch_id}/process"), Some(user), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["processed"], 2);
        assert_eq!(body["data"]["succeeded"], 2);

        let (status, body) = app
            .send(
                "POST",
                &format!("/imports/{batch_id}/convert"),
                Some(user),
                Some(json!({ "min_confidence": 0.8 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["attempted"], 1);
        assert_eq!(body["data"]["succeeded"], 1);
        assert_eq!(app.store.event_count(), 1);

        let (_, body) = app.send("GET", &format!("/imports/{batch_id}"), Some(user), None).await;
        assert_eq!(body["data"]["status"], "completed");
        assert_eq!(body["data"]["progress"]["converted"], 1);
        assert_eq!(body["data"]["progress"]["parsed"], 1);
    }

    #[tokio::test]
    async fn invalid_threshold_is_a_bad_request() {
        let app = test_app();
        let user = Uuid::new_v4();
        let (_, body) = app.send("POST", "/imports", Some(user), Some(manual_batch())).await;
        let batch_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .send(
                "POST",
                &format!("/imports/{batch_id}/convert"),
                Some(user),
                Some(json!({ "min_confidence": 1.5 })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn review_sets_notes() {
        let app = test_app();
        let user = Uuid::new_v4();
        let (_, body) = app.send("POST", "/imports", Some(user), Some(manual_batch())).await;
        let batch_id = body["data"]["id"].as_str().unwrap().to_string();
        let (_, body) = app
            .send("GET", &format!("/imports/{batch_id}/records"), Some(user), None)
            .await;
        let record_id = body["data"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = app
            .send(
                "PATCH",
                &format!("/records/{record_id}/review"),
                Some(user),
                Some(json!({ "manual_review_required": true, "notes": "check the date" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["manual_review_required"], true);
        assert_eq!(body["data"]["manual_review_notes"], "check the date");
    }
}
