//! Best-effort usage summary caching.

use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, CacheResult, SummaryCache};
use crate::observability::MetricsRegistry;
use crate::types::{TenantId, UsageSummary};

pub const DEFAULT_KEY_PREFIX: &str = "ledger:";
pub const DEFAULT_SUMMARY_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub key_prefix: String,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_SUMMARY_TTL,
        }
    }
}

impl CacheConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> CacheResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-')
        {
            return Err(CacheError::InvalidConfig {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, hyphen, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Wraps an optional [`SummaryCache`]; every failure is logged and swallowed.
#[derive(Clone)]
pub struct SummaryCacheLayer {
    cache: Option<Arc<dyn SummaryCache>>,
    config: CacheConfig,
    metrics: Arc<MetricsRegistry>,
}

impl SummaryCacheLayer {
    pub fn new(
        cache: Option<Arc<dyn SummaryCache>>,
        config: CacheConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            cache,
            config,
            metrics,
        }
    }

    pub fn disabled(metrics: Arc<MetricsRegistry>) -> Self {
        Self::new(None, CacheConfig::default(), metrics)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key(&self, tenant_id: &TenantId) -> String {
        format!("{}usage:{}", self.config.key_prefix, tenant_id)
    }

    /// Cached summary, or `None` on a miss, an undecodable entry or a cache error.
    pub async fn get(&self, tenant_id: &TenantId) -> Option<UsageSummary> {
        let cache = self.cache.as_ref()?;
        let key = self.key(tenant_id);

        let raw = match cache.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.metrics.record_cache_miss();
                return None;
            }
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(backend = cache.name(), key = %key, error = %e, "Usage summary cache read failed");
                return None;
            }
        };

        match serde_json::from_str::<UsageSummary>(&raw) {
            Ok(summary) => {
                self.metrics.record_cache_hit();
                Some(summary)
            }
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(key = %key, error = %e, "Discarding undecodable usage summary");
                self.invalidate(tenant_id).await;
                None
            }
        }
    }

    /// Populate after a read-path recompute.
    pub async fn put(&self, summary: &UsageSummary) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let key = self.key(&summary.tenant_id);
        let result = match serde_json::to_string(summary) {
            Ok(raw) => cache.set(&key, &raw, self.config.ttl).await,
            Err(e) => Err(CacheError::from(e)),
        };
        if let Err(e) = result {
            self.metrics.record_cache_error();
            tracing::warn!(backend = cache.name(), key = %key, error = %e, "Usage summary cache write failed");
        }
    }

    /// Drop the tenant's entry. Called after every ledger mutation commits.
    pub async fn invalidate(&self, tenant_id: &TenantId) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let key = self.key(tenant_id);
        match cache.delete(&key).await {
            Ok(removed) => tracing::trace!(key = %key, removed, "Usage summary invalidated"),
            Err(e) => {
                self.metrics.record_cache_error();
                tracing::warn!(
                    backend = cache.name(),
                    key = %key,
                    error = %e,
                    "Usage summary invalidation failed; entry expires with its TTL"
                );
            }
        }
    }
}

impl std::fmt::Debug for SummaryCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCacheLayer")
            .field("backend", &self.cache.as_ref().map(|c| c.name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}
