//! AI service client
//!
//! HTTP client for the internal LLM service. Implements both collaborator
//! traits the pipeline depends on:
//! - Text analysis of imported records and events
//! - Schedule optimization for a task list

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::domain::{ParsedFields, Priority};
use crate::error::CollaboratorError;
use crate::pipeline::collaborators::{
    AnalysisContext, OptimizationPlan, OptimizationRequest, ScheduleOptimizerAi, TextAnalysis,
    TextAnalyzer,
};

/// Client for the AI service.
#[derive(Clone)]
pub struct AiClient {
    client: Client,
    base_url: String,
    token: String,
}

/// Error response from AI service.
#[derive(Debug, Deserialize)]
struct AiErrorResponse {
    message: String,
}

impl AiClient {
    /// Create a new AI service client.
    pub fn new(base_url: &str, token: &str, timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!(base_url = base_url, "AI client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// POSTs `body` and returns the raw JSON reply.
    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<serde_json::Value, CollaboratorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "AI service request");

        let response = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "AI service request failed");
                if e.is_timeout() {
                    CollaboratorError::new(crate::error::CollaboratorErrorKind::Timeout, e.to_string())
                } else {
                    CollaboratorError::unknown(format!("AI service unavailable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<serde_json::Value>().await.map_err(|e| {
                error!(error = %e, "Failed to parse AI service response");
                CollaboratorError::bad_response(format!("invalid JSON: {e}"))
            });
        }

        let message = response
            .json::<AiErrorResponse>()
            .await
            .map(|e| e.message)
            .unwrap_or_else(|_| format!("AI service error: {status}"));
        error!(status = %status, message = %message, "AI service error");
        Err(classify_status(status, message))
    }

    /// Check AI service health.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);

        self.client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("AI service health check failed")?
            .error_for_status()
            .context("AI service unhealthy")?;

        Ok(())
    }
}

fn classify_status(status: StatusCode, message: String) -> CollaboratorError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CollaboratorError::rate_limited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CollaboratorError::new(
            crate::error::CollaboratorErrorKind::Timeout,
            message,
        ),
        StatusCode::UNPROCESSABLE_ENTITY => CollaboratorError::bad_response(message),
        _ => CollaboratorError::unknown(format!("{status}: {message}")),
    }
}

fn decode<R: DeserializeOwned>(payload: &serde_json::Value) -> Result<R, CollaboratorError> {
    R::deserialize(payload).map_err(|e| CollaboratorError::bad_response(format!("unexpected payload: {e}")))
}

// =========================================================================
// Text Analysis
// =========================================================================

#[derive(Serialize)]
struct AnalyzeTextRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    profession: Option<&'a str>,
    hints: &'a ParsedFields,
    keywords: &'a [String],
}

#[derive(Deserialize)]
struct AnalyzeTextResponse {
    #[serde(default)]
    fields: ParsedFields,
    confidence: f64,
    category: Option<String>,
    importance: Option<String>,
}

fn text_analysis_from(payload: serde_json::Value) -> Result<TextAnalysis, CollaboratorError> {
    let response: AnalyzeTextResponse = decode(&payload)?;
    Ok(TextAnalysis {
        fields: response.fields,
        confidence: response.confidence,
        category: response.category.map(|c| c.trim().to_lowercase()).filter(|c| !c.is_empty()),
        importance: response.importance.as_deref().and_then(Priority::from_label),
        raw_payload: payload,
    })
}

#[async_trait]
impl TextAnalyzer for AiClient {
    #[instrument(skip(self, text, context))]
    async fn analyze(&self, text: &str, context: &AnalysisContext) -> Result<TextAnalysis, CollaboratorError> {
        let payload = self
            .post(
                "/v1/schedule/analyze-text",
                &AnalyzeTextRequest {
                    text,
                    profession: context.profession.as_deref(),
                    hints: &context.hints,
                    keywords: &context.keywords,
                },
            )
            .await?;

        text_analysis_from(payload)
    }
}

// =========================================================================
// Schedule Optimization
// =========================================================================

fn plan_from(payload: serde_json::Value) -> Result<OptimizationPlan, CollaboratorError> {
    let mut plan: OptimizationPlan = decode(&payload)?;
    plan.raw_payload = payload;
    Ok(plan)
}

#[async_trait]
impl ScheduleOptimizerAi for AiClient {
    #[instrument(skip(self, request), fields(tasks = request.tasks.len(), date = %request.target_date))]
    async fn optimize(&self, request: &OptimizationRequest) -> Result<OptimizationPlan, CollaboratorError> {
        let payload = self.post("/v1/schedule/optimize", request).await?;
        plan_from(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorErrorKind;
    use serde_json::json;

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()).kind,
            CollaboratorErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, "late".into()).kind,
            CollaboratorErrorKind::Timeout
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".into()).kind,
            CollaboratorErrorKind::Unknown
        );
    }

    #[test]
    fn analysis_payload_keeps_raw_body() {
        let payload = json!({
            "fields": { "title": "Team meeting", "start_at": "2024-03-08T09:00:00Z" },
            "confidence": 0.92,
            "category": " Meeting ",
            "importance": "high",
            "model": "x"
        });

        let analysis = text_analysis_from(payload.clone()).unwrap();
        assert_eq!(analysis.fields.title.as_deref(), Some("Team meeting"));
        assert_eq!(analysis.category.as_deref(), Some("meeting"));
        assert_eq!(analysis.importance, Some(Priority::High));
        assert_eq!(analysis.raw_payload, payload);
    }

    #[test]
    fn missing_confidence_is_bad_response() {
        let err = text_analysis_from(json!({ "fields": {} })).unwrap_err();
        assert_eq!(err.kind, CollaboratorErrorKind::BadResponse);
    }

    #[test]
    fn plan_payload_parses_slots() {
        let payload = json!({
            "slots": [
                { "task_id": "a", "start_time": "09:00:00", "end_time": "10:00:00", "suitability_score": 0.7 }
            ],
            "unplaced_task_ids": ["b"]
        });

        let plan = plan_from(payload.clone()).unwrap();
        assert_eq!(plan.slots.len(), 1);
        assert!(!plan.slots[0].is_flexible);
        assert_eq!(plan.unplaced_task_ids, vec!["b".to_string()]);
        assert_eq!(plan.raw_payload, payload);
    }
}
