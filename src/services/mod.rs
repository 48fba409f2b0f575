//! Service layer modules for external integrations.
//!
//! Contains clients for Redis caching, AI service communication, and in-app
//! reminder delivery.

pub mod ai_client;
pub mod cache;
pub mod notifications;

pub use ai_client::AiClient;
pub use cache::RedisCache;
pub use notifications::InAppReminderSink;
