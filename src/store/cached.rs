//! Read-through Redis cache for parsing rules.
//!
//! Rule lists are read for every processed batch and change rarely. Writes
//! that change which rules apply drop every cached list; counter bumps do
//! not, so cached usage/success counts may lag until the TTL expires.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::{RuleStore, StoreResult};
use crate::domain::ParsingRule;
use crate::services::cache::{keys, RedisCache};

pub struct CachedRules {
    inner: Arc<dyn RuleStore>,
    cache: RedisCache,
}

impl CachedRules {
    pub fn new(inner: Arc<dyn RuleStore>, cache: RedisCache) -> Self {
        Self { inner, cache }
    }

    async fn invalidate(&self) {
        if let Err(e) = self.cache.delete_pattern(&keys::rules_pattern()).await {
            tracing::warn!(error = %e, "Failed to invalidate cached rules");
        }
    }
}

#[async_trait]
impl RuleStore for CachedRules {
    async fn active_rules(&self, profession: Option<&str>) -> StoreResult<Vec<ParsingRule>> {
        let key = keys::active_rules(profession);
        if let Some(rules) = self.cache.get::<Vec<ParsingRule>>(&key).await {
            return Ok(rules);
        }

        let rules = self.inner.active_rules(profession).await?;
        if let Err(e) = self.cache.set(&key, &rules).await {
            tracing::warn!(key = %key, error = %e, "Failed to cache rules");
        }
        Ok(rules)
    }

    async fn insert_rule(&self, rule: &ParsingRule) -> StoreResult<()> {
        self.inner.insert_rule(rule).await?;
        self.invalidate().await;
        Ok(())
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> StoreResult<bool> {
        let changed = self.inner.set_rule_active(id, active).await?;
        if changed {
            self.invalidate().await;
        }
        Ok(changed)
    }

    async fn record_usage(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        self.inner.record_usage(rule_ids).await
    }

    async fn record_success(&self, rule_ids: &[Uuid]) -> StoreResult<()> {
        self.inner.record_success(rule_ids).await
    }
}
