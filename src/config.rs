use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_cache_ttl_seconds: u64,

    // HTTP
    pub cors_allow_origins: Vec<String>,
    pub max_request_bytes: usize,

    // AI Service
    pub ai_service_url: String,
    pub ai_service_token: String,
    pub ai_service_timeout_seconds: u64,

    // Pipeline
    pub review_confidence_threshold: f64,
    pub record_concurrency: usize,
    pub analysis_stale_after_seconds: i64,

    // Reminders
    pub reminder_poll_seconds: u64,
    pub default_reminder_minutes: i32,
}

/// Reads `key` and parses it, falling back to `default` when unset or invalid.
fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = parsed_or("DATABASE_MAX_CONNECTIONS", 10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());
        let redis_cache_ttl_seconds = parsed_or("REDIS_CACHE_TTL_SECONDS", 3600); // 1 hour default

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        // Pasted imports arrive as one JSON body
        let max_request_bytes = parsed_or("MAX_REQUEST_BYTES", 10 * 1024 * 1024usize);

        // AI Service
        let ai_service_url =
            env::var("AI_SERVICE_URL").unwrap_or_else(|_| "http://ai-service:8000".to_string());
        let ai_service_token =
            env::var("AI_SERVICE_TOKEN").context("AI_SERVICE_TOKEN must be set")?;
        let ai_service_timeout_seconds = parsed_or("AI_SERVICE_TIMEOUT_SECONDS", 120); // 2 minutes default for LLM calls

        // Pipeline
        let review_confidence_threshold: f64 = parsed_or("REVIEW_CONFIDENCE_THRESHOLD", 0.7);
        if !(0.0..=1.0).contains(&review_confidence_threshold) {
            anyhow::bail!("REVIEW_CONFIDENCE_THRESHOLD must be within 0.0..=1.0");
        }
        let record_concurrency = parsed_or("RECORD_CONCURRENCY", 4usize).max(1);
        let analysis_stale_after_seconds = parsed_or("ANALYSIS_STALE_AFTER_SECONDS", 600);

        // Reminders
        let reminder_poll_seconds = parsed_or("REMINDER_POLL_SECONDS", 60u64).max(1);
        let default_reminder_minutes = parsed_or("DEFAULT_REMINDER_MINUTES", 15);

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            redis_cache_ttl_seconds,
            cors_allow_origins,
            max_request_bytes,
            ai_service_url,
            ai_service_token,
            ai_service_timeout_seconds,
            review_confidence_threshold,
            record_concurrency,
            analysis_stale_after_seconds,
            reminder_poll_seconds,
            default_reminder_minutes,
        })
    }
}

#[cfg(test)]
impl Settings {
    /// Defaults for router tests; nothing here is dialed.
    pub fn local() -> Self {
        Settings {
            env: Environment::Dev,
            server_addr: "127.0.0.1:0".to_string(),
            database_url: "postgres://localhost/schedule_import_test".to_string(),
            database_max_connections: 1,
            redis_url: "redis://localhost:6379/0".to_string(),
            redis_cache_ttl_seconds: 60,
            cors_allow_origins: vec!["http://localhost:3000".to_string()],
            max_request_bytes: 64 * 1024,
            ai_service_url: "http://localhost:8000".to_string(),
            ai_service_token: "test".to_string(),
            ai_service_timeout_seconds: 1,
            review_confidence_threshold: 0.7,
            record_concurrency: 2,
            analysis_stale_after_seconds: 600,
            reminder_poll_seconds: 60,
            default_reminder_minutes: 15,
        }
    }
}
