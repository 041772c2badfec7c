//! Ledger store traits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::StoreResult;
use super::memory::MemoryLedgerStore;
use crate::types::{CreditGrant, GrantId, Tenant, TenantId, UsageEvent, UsageType};

/// A transaction holding the exclusive lock of one tenant.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// every staged write.
#[async_trait::async_trait]
pub trait LedgerTransaction: Send {
    /// The tenant row read under the lock.
    fn tenant(&self) -> &Tenant;

    /// Sum of usage of `usage_type` with `start <= created_at < end`.
    async fn usage_between(
        &mut self,
        usage_type: UsageType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Per-type usage totals in `[start, end)`. Types without events are absent.
    async fn usage_by_type(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<HashMap<UsageType, u64>>;

    /// Every grant of the tenant, locked against concurrent debits.
    async fn grants_for_update(&mut self) -> StoreResult<Vec<CreditGrant>>;

    async fn append_usage(&mut self, event: &UsageEvent) -> StoreResult<()>;

    /// Create a grant for the locked tenant.
    async fn add_grant(&mut self, grant: &CreditGrant) -> StoreResult<()>;

    /// Take `amount` from a grant and return what it has left.
    ///
    /// The check and the decrement are one step against the stored value, so a
    /// stale read can never push a grant below zero: the call fails with
    /// [`StoreError::Overdrawn`](super::StoreError::Overdrawn) instead.
    async fn deduct(&mut self, grant_id: GrantId, amount: u64) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Backend holding tenants, credit grants and usage events.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a tenant; returns `false` if it already existed.
    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<bool>;

    async fn load_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>>;

    async fn insert_grant(&self, grant: &CreditGrant) -> StoreResult<()>;

    async fn list_grants(&self, tenant_id: &TenantId) -> StoreResult<Vec<CreditGrant>>;

    async fn list_usage(
        &self,
        tenant_id: &TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>>;

    /// Delete usage events created strictly before `cutoff`.
    async fn purge_usage_before(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Open a transaction holding the tenant's exclusive lock.
    async fn begin(&self, tenant_id: &TenantId) -> StoreResult<Box<dyn LedgerTransaction>>;
}

/// Store factory for creating backends
pub struct StoreFactory;

impl StoreFactory {
    /// Create a memory ledger store
    pub fn memory() -> Arc<dyn LedgerStore> {
        Arc::new(MemoryLedgerStore::new())
    }

    /// Connect to PostgreSQL and create the ledger tables if missing.
    #[cfg(feature = "postgres")]
    pub async fn postgres(
        config: super::postgres::PostgresConfig,
    ) -> StoreResult<Arc<dyn LedgerStore>> {
        let store = super::postgres::PostgresLedgerStore::connect(config).await?;
        store.migrate().await?;
        Ok(Arc::new(store))
    }
}
