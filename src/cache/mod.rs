//! Read-through cache for tenant usage summaries.
//!
//! The cache is advisory. The ledger store stays the authority; entries are
//! deleted, never rewritten, on every ledger mutation, and a failing or absent
//! cache only makes summary reads slower.

mod layer;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use layer::{CacheConfig, SummaryCacheLayer};
pub use memory::MemorySummaryCache;
#[cfg(feature = "redis-backend")]
pub use redis::{RedisCacheConfig, RedisSummaryCache};

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {message}")]
    Backend { message: String },

    #[error("Cache operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Invalid cache configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Minimal key-value contract the summary layer needs from a cache backend.
#[async_trait::async_trait]
pub trait SummaryCache: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;
}
