//! Typed ledger settings resolved from a [`ConfigProvider`].
//!
//! Recognized keys (all optional):
//!
//! | key | meaning |
//! |---|---|
//! | `limits` | JSON `{ "GUEST": { "AUDIO_GENERATION": 10 } }` overlaid on the defaults |
//! | `retention.guest_days`, `retention.standard_days` | usage history retention |
//! | `cache.ttl_secs`, `cache.key_prefix` | usage summary cache |
//! | `trial.enabled`, `trial.amount`, `trial.ttl_days` | guest trial bundle |
//! | `retry.max_conflicts`, `retry.initial_backoff_ms`, `retry.max_backoff_ms` | conflict retry |
//! | `database.url`, `database.table_prefix` | PostgreSQL store |
//! | `redis.url` | Redis summary cache |

use std::time::Duration;

use secrecy::SecretString;

use super::provider::{ConfigProvider, ConfigProviderExt};
use super::{ConfigError, ConfigResult};
use crate::cache::CacheConfig;
use crate::ledger::{RetryPolicy, TrialGrantPolicy};
use crate::limits::{LimitTable, LimitsDocument};
use crate::types::Tier;

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub limits: LimitTable,
    pub cache: CacheConfig,
    pub trial: TrialGrantPolicy,
    pub retry: RetryPolicy,
    pub database_url: Option<SecretString>,
    pub database_table_prefix: Option<String>,
    pub redis_url: Option<SecretString>,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            limits: LimitTable::builder().with_defaults().build(),
            cache: CacheConfig::default(),
            trial: TrialGrantPolicy::default(),
            retry: RetryPolicy::default(),
            database_url: None,
            database_table_prefix: None,
            redis_url: None,
        }
    }
}

impl LedgerSettings {
    /// Resolve every key against `provider`, falling back to defaults for
    /// absent ones. A present but unparsable value is an error.
    pub async fn load(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let mut settings = Self::default();

        let mut limits = LimitTable::builder().with_defaults();
        if let Some(document) = provider.get_json::<LimitsDocument>("limits").await? {
            limits = limits.document(&document);
        }
        for (tier, key) in [
            (Tier::Guest, "retention.guest_days"),
            (Tier::Standard, "retention.standard_days"),
        ] {
            if let Some(days) = provider.get_parsed::<u32>(key).await? {
                limits = limits.retention_days(tier, days);
            }
        }
        settings.limits = limits.build();

        if let Some(secs) = provider.get_parsed::<u64>("cache.ttl_secs").await? {
            settings.cache = settings.cache.ttl(Duration::from_secs(secs));
        }
        if let Some(prefix) = provider.get_raw("cache.key_prefix").await? {
            settings.cache =
                settings
                    .cache
                    .prefix(prefix)
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "cache.key_prefix".into(),
                        message: e.to_string(),
                    })?;
        }

        if let Some(enabled) = provider.get_parsed::<bool>("trial.enabled").await? {
            settings.trial.enabled = enabled;
        }
        if let Some(amount) = provider.get_parsed::<u64>("trial.amount").await? {
            settings.trial.amount = amount;
        }
        if let Some(days) = provider.get_parsed::<u32>("trial.ttl_days").await? {
            settings.trial.ttl = chrono::Duration::days(i64::from(days));
        }

        if let Some(n) = provider.get_parsed::<u32>("retry.max_conflicts").await? {
            settings.retry.max_conflict_retries = n;
        }
        if let Some(ms) = provider.get_parsed::<u64>("retry.initial_backoff_ms").await? {
            settings.retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = provider.get_parsed::<u64>("retry.max_backoff_ms").await? {
            settings.retry.max_backoff = Duration::from_millis(ms);
        }

        settings.database_url = provider
            .get_raw("database.url")
            .await?
            .map(SecretString::from);
        settings.database_table_prefix = provider.get_raw("database.table_prefix").await?;
        settings.redis_url = provider.get_raw("redis.url").await?.map(SecretString::from);

        tracing::debug!(
            provider = provider.name(),
            cache_ttl_secs = settings.cache.ttl.as_secs(),
            trial_enabled = settings.trial.enabled,
            max_conflict_retries = settings.retry.max_conflict_retries,
            database = settings.database_url.is_some(),
            redis = settings.redis_url.is_some(),
            "Ledger settings loaded"
        );
        Ok(settings)
    }
}
