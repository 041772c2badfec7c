//! Redis backend for the usage summary cache.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use secrecy::{ExposeSecret, SecretString};

use super::{CacheError, CacheResult, SummaryCache};
use crate::store::with_retry;

#[derive(Clone, Debug)]
pub struct RedisCacheConfig {
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(1),
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RedisCacheConfig {
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

pub struct RedisSummaryCache {
    client: Arc<redis::Client>,
    config: RedisCacheConfig,
}

impl RedisSummaryCache {
    pub fn new(redis_url: &SecretString) -> CacheResult<Self> {
        Self::from_config(redis_url, RedisCacheConfig::default())
    }

    pub fn from_config(redis_url: &SecretString, config: RedisCacheConfig) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url.expose_secret()).map_err(backend_err)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    async fn get_connection(&self) -> CacheResult<redis::aio::MultiplexedConnection> {
        with_retry(
            self.config.max_retries,
            self.config.initial_backoff,
            self.config.max_backoff,
            Self::is_retryable,
            || async {
                tokio::time::timeout(
                    self.config.connection_timeout,
                    self.client.get_multiplexed_async_connection(),
                )
                .await
                .map_err(|_| CacheError::Timeout(self.config.connection_timeout))?
                .map_err(backend_err)
            },
        )
        .await
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.config.response_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(self.config.response_timeout))?
            .map_err(backend_err)
    }

    fn is_retryable(error: &CacheError) -> bool {
        match error {
            CacheError::Timeout(_) => true,
            CacheError::Backend { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
                    || message.contains("CLUSTERDOWN")
            }
            _ => false,
        }
    }
}

fn backend_err(e: redis::RedisError) -> CacheError {
    CacheError::Backend {
        message: e.to_string(),
    }
}

#[async_trait::async_trait]
impl SummaryCache for RedisSummaryCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.get_connection().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let secs = ttl.as_secs().max(1);
        self.bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(secs)
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RedisSummaryCache::is_retryable(&CacheError::Timeout(
            Duration::from_secs(1)
        )));
        assert!(RedisSummaryCache::is_retryable(&CacheError::Backend {
            message: "LOADING Redis is loading the dataset".into()
        }));
        assert!(!RedisSummaryCache::is_retryable(&CacheError::Backend {
            message: "WRONGTYPE Operation against a key".into()
        }));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let url = SecretString::from("not a url");
        assert!(RedisSummaryCache::new(&url).is_err());
    }

    #[test]
    fn test_config_builders() {
        let config = RedisCacheConfig::default()
            .connection_timeout(Duration::from_secs(5))
            .response_timeout(Duration::from_millis(250))
            .max_retries(0);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 0);
    }
}
