//! Transactional ledger storage.
//!
//! The store is the single authority for tenants, credit grants and usage
//! events. Every backend must provide a per-tenant exclusive transaction so
//! that admission checks and debits for one tenant serialize while different
//! tenants proceed independently.

pub mod memory;
pub mod persistence;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use persistence::{LedgerStore, LedgerTransaction, StoreFactory};
#[cfg(feature = "postgres")]
pub use postgres::{PgPoolConfig, PostgresConfig, PostgresLedgerStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Tenant not found: {id}")]
    TenantNotFound { id: String },

    #[error("Grant not found: {id}")]
    GrantNotFound { id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Lost a race against a concurrent transaction; safe to retry.
    #[error("Transaction conflict: {message}")]
    Conflict { message: String },

    /// A debit asked a grant for more than it holds.
    #[error("Debit of {requested} exceeds remaining credit {available}")]
    Overdrawn { requested: u64, available: u64 },

    #[error("Corrupt ledger row: {message}")]
    Corrupt { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

/// Retry `operation` with jittered exponential backoff while `is_retryable`
/// accepts the error.
pub(crate) async fn with_retry<F, Fut, T, E>(
    max_retries: u32,
    initial_backoff: std::time::Duration,
    max_backoff: std::time::Duration,
    is_retryable: impl Fn(&E) -> bool,
    operation: F,
) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying ledger operation after transient failure"
                );
                // Symmetrical 10% jitter to prevent thundering herd
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
