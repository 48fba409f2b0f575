mod api;
mod app;
mod config;
mod db;
mod domain;
mod error;
mod logging;
mod middleware;
mod pipeline;
mod routes;
mod services;
mod store;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use pipeline::{ReminderSink, SystemClock};
use services::{AiClient, InAppReminderSink, RedisCache};
use store::{CachedRules, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting schedule import backend"
    );

    // Create database pool
    let pool = db::create_pool(&settings).await?;
    let pg = Arc::new(PgStore::new(pool.clone()));

    // Parsing rules are read through Redis when it is reachable
    let cache = match RedisCache::new(&settings.redis_url, settings.redis_cache_ttl_seconds).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable - parsing rules will be read from Postgres directly");
            None
        }
    };
    let rules: Arc<dyn store::RuleStore> = match &cache {
        Some(cache) => Arc::new(CachedRules::new(pg.clone(), cache.clone())),
        None => pg.clone(),
    };

    // Create AI service client
    let ai_client = AiClient::new(
        &settings.ai_service_url,
        &settings.ai_service_token,
        settings.ai_service_timeout_seconds,
    )?;

    // Optionally check AI service health (non-blocking)
    tokio::spawn({
        let ai_client = ai_client.clone();
        async move {
            match ai_client.health_check().await {
                Ok(()) => tracing::info!("AI service is healthy"),
                Err(e) => tracing::warn!(error = %e, "AI service health check failed - will retry on first request"),
            }
        }
    });

    let state = app::AppState::new(
        settings.clone(),
        app::Backends {
            imports: pg.clone(),
            events: pg.clone(),
            schedule: pg.clone(),
            rules,
            analyzer: Arc::new(ai_client.clone()),
            optimizer: Arc::new(ai_client.clone()),
            clock: Arc::new(SystemClock),
        },
    )
    .with_services(Some(pool.clone()), cache, Some(ai_client));
    let state = Arc::new(state);

    // Reminder dispatch worker
    let sink: Arc<dyn ReminderSink> = Arc::new(InAppReminderSink::new(pool));
    let dispatcher = state
        .reminders
        .clone()
        .spawn_dispatcher(sink, Duration::from_secs(settings.reminder_poll_seconds));
    tracing::info!(every_seconds = settings.reminder_poll_seconds, "Reminder dispatcher started");

    // Build application
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    let served = axum::serve(listener, app).await;
    dispatcher.abort();
    served?;

    Ok(())
}
