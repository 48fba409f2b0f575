use axum::{extract::DefaultBodyLimit, http::HeaderValue, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::config::Settings;
use crate::middleware::request_id_layer;
use crate::pipeline::{
    AnalysisPipeline, Clock, ConversionEngine, EventAnalysis, NotificationScheduler, PipelineConfig,
    ScheduleOptimizer, ScheduleOptimizerAi, TextAnalyzer,
};
use crate::routes;
use crate::services::{AiClient, RedisCache};
use crate::store::{EventStore, ImportStore, RuleStore, ScheduleStore};

/// Storage and collaborator handles the engines are built from
#[derive(Clone)]
pub struct Backends {
    pub imports: Arc<dyn ImportStore>,
    pub events: Arc<dyn EventStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub rules: Arc<dyn RuleStore>,
    pub analyzer: Arc<dyn TextAnalyzer>,
    pub optimizer: Arc<dyn ScheduleOptimizerAi>,
    pub clock: Arc<dyn Clock>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    /// Infrastructure handles, probed by the health endpoint when present
    pub db: Option<PgPool>,
    pub cache: Option<RedisCache>,
    pub ai_client: Option<AiClient>,

    pub imports: Arc<dyn ImportStore>,
    pub events: Arc<dyn EventStore>,
    pub schedule: Arc<dyn ScheduleStore>,
    pub rules: Arc<dyn RuleStore>,
    pub clock: Arc<dyn Clock>,

    pub analysis: Arc<AnalysisPipeline>,
    pub conversion: Arc<ConversionEngine>,
    pub event_analysis: Arc<EventAnalysis>,
    pub optimizer: Arc<ScheduleOptimizer>,
    pub reminders: Arc<NotificationScheduler>,
}

impl AppState {
    pub fn new(settings: Settings, backends: Backends) -> Self {
        let config = PipelineConfig::from(&settings);
        let Backends {
            imports,
            events,
            schedule,
            rules,
            analyzer,
            optimizer,
            clock,
        } = backends;

        Self {
            analysis: Arc::new(AnalysisPipeline::new(
                imports.clone(),
                rules.clone(),
                analyzer.clone(),
                clock.clone(),
                config.clone(),
            )),
            conversion: Arc::new(ConversionEngine::new(imports.clone(), rules.clone(), clock.clone())),
            event_analysis: Arc::new(EventAnalysis::new(
                events.clone(),
                analyzer,
                clock.clone(),
                config.clone(),
            )),
            optimizer: Arc::new(ScheduleOptimizer::new(
                schedule.clone(),
                events.clone(),
                optimizer,
                clock.clone(),
                config,
            )),
            reminders: Arc::new(NotificationScheduler::new(schedule.clone(), clock.clone())),
            settings,
            db: None,
            cache: None,
            ai_client: None,
            imports,
            events,
            schedule,
            rules,
            clock,
        }
    }

    pub fn with_services(mut self, db: Option<PgPool>, cache: Option<RedisCache>, ai_client: Option<AiClient>) -> Self {
        self.db = db;
        self.cache = cache;
        self.ai_client = ai_client;
        self
    }
}

/// Build the complete application with all middleware
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.settings);

    // DEBUG spans keep per-request overhead out of INFO logs
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let (set_request_id, propagate_request_id) = request_id_layer();

    Router::new()
        .merge(routes::api_router())
        // Middleware stack (applied bottom-up)
        .layer(propagate_request_id)
        .layer(trace_layer)
        .layer(set_request_id)
        // One request-wide cap instead of the per-extractor default
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.settings.max_request_bytes))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allow_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let max_age = if settings.env.is_dev() {
        std::time::Duration::from_secs(86400)
    } else {
        std::time::Duration::from_secs(3600)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(AllowMethods::list([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-request-id"),
            axum::http::HeaderName::from_static("x-user-id"),
        ]))
        .allow_credentials(true)
        .max_age(max_age)
}
