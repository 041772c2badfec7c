//! In-memory ledger store (for testing and single-instance deployments).
//!
//! Each tenant's book sits behind its own async mutex; a transaction owns the
//! guard for its whole lifetime and stages writes until commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::persistence::{LedgerStore, LedgerTransaction};
use super::{StoreError, StoreResult};
use crate::types::{CreditGrant, GrantId, Tenant, TenantId, UsageEvent, UsageType};

#[derive(Debug)]
struct TenantBook {
    tenant: Tenant,
    grants: Vec<CreditGrant>,
    usage: Vec<UsageEvent>,
}

impl TenantBook {
    fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            grants: Vec::new(),
            usage: Vec::new(),
        }
    }
}

fn sum_usage<'a>(
    events: impl Iterator<Item = &'a UsageEvent>,
    usage_type: UsageType,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> u64 {
    events
        .filter(|e| e.usage_type == usage_type && e.created_at >= start && e.created_at < end)
        .fold(0u64, |acc, e| acc.saturating_add(e.amount))
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLedgerStore {
    books: Arc<DashMap<TenantId, Arc<Mutex<TenantBook>>>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered tenants
    pub fn tenant_count(&self) -> usize {
        self.books.len()
    }

    /// Drop every tenant and its history
    pub fn clear(&self) {
        self.books.clear();
    }

    fn book(&self, tenant_id: &TenantId) -> StoreResult<Arc<Mutex<TenantBook>>> {
        self.books
            .get(tenant_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::TenantNotFound {
                id: tenant_id.to_string(),
            })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<bool> {
        match self.books.entry(tenant.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(TenantBook::new(tenant.clone()))));
                Ok(true)
            }
        }
    }

    async fn load_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        let Some(book) = self.books.get(id).map(|e| Arc::clone(e.value())) else {
            return Ok(None);
        };
        let book = book.lock().await;
        Ok(Some(book.tenant.clone()))
    }

    async fn insert_grant(&self, grant: &CreditGrant) -> StoreResult<()> {
        let book = self.book(&grant.tenant_id)?;
        let mut book = book.lock().await;
        book.grants.push(grant.clone());
        Ok(())
    }

    async fn list_grants(&self, tenant_id: &TenantId) -> StoreResult<Vec<CreditGrant>> {
        let book = self.book(tenant_id)?;
        let book = book.lock().await;
        Ok(book.grants.clone())
    }

    async fn list_usage(
        &self,
        tenant_id: &TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<UsageEvent>> {
        let book = self.book(tenant_id)?;
        let book = book.lock().await;
        Ok(book
            .usage
            .iter()
            .filter(|e| e.created_at >= start && e.created_at < end)
            .cloned()
            .collect())
    }

    async fn purge_usage_before(
        &self,
        tenant_id: &TenantId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let book = self.book(tenant_id)?;
        let mut book = book.lock().await;
        let before = book.usage.len();
        book.usage.retain(|e| e.created_at >= cutoff);
        Ok((before - book.usage.len()) as u64)
    }

    async fn begin(&self, tenant_id: &TenantId) -> StoreResult<Box<dyn LedgerTransaction>> {
        let book = self.book(tenant_id)?;
        let guard = book.lock_owned().await;
        let tenant = guard.tenant.clone();
        Ok(Box::new(MemoryTransaction {
            book: guard,
            tenant,
            staged_usage: Vec::new(),
            staged_grants: Vec::new(),
            staged_remaining: HashMap::new(),
        }))
    }
}

struct MemoryTransaction {
    book: OwnedMutexGuard<TenantBook>,
    tenant: Tenant,
    staged_usage: Vec<UsageEvent>,
    staged_grants: Vec<CreditGrant>,
    staged_remaining: HashMap<GrantId, u64>,
}

impl MemoryTransaction {
    fn current_remaining(&self, grant: &CreditGrant) -> u64 {
        self.staged_remaining
            .get(&grant.id)
            .copied()
            .unwrap_or(grant.remaining)
    }

    fn visible_grants(&self) -> impl Iterator<Item = &CreditGrant> {
        self.book.grants.iter().chain(self.staged_grants.iter())
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    async fn usage_between(
        &mut self,
        usage_type: UsageType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let events = self.book.usage.iter().chain(self.staged_usage.iter());
        Ok(sum_usage(events, usage_type, start, end))
    }

    async fn usage_by_type(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<HashMap<UsageType, u64>> {
        let mut totals = HashMap::new();
        for event in self
            .book
            .usage
            .iter()
            .chain(self.staged_usage.iter())
            .filter(|e| e.created_at >= start && e.created_at < end)
        {
            let total = totals.entry(event.usage_type).or_insert(0u64);
            *total = total.saturating_add(event.amount);
        }
        Ok(totals)
    }

    async fn grants_for_update(&mut self) -> StoreResult<Vec<CreditGrant>> {
        Ok(self
            .visible_grants()
            .map(|grant| CreditGrant {
                remaining: self.current_remaining(grant),
                ..grant.clone()
            })
            .collect())
    }

    async fn append_usage(&mut self, event: &UsageEvent) -> StoreResult<()> {
        if event.tenant_id != self.tenant.id {
            return Err(StoreError::Storage {
                message: format!(
                    "usage event for tenant {} written in transaction of {}",
                    event.tenant_id, self.tenant.id
                ),
            });
        }
        self.staged_usage.push(event.clone());
        Ok(())
    }

    async fn add_grant(&mut self, grant: &CreditGrant) -> StoreResult<()> {
        if grant.tenant_id != self.tenant.id {
            return Err(StoreError::Storage {
                message: format!(
                    "grant for tenant {} written in transaction of {}",
                    grant.tenant_id, self.tenant.id
                ),
            });
        }
        self.staged_grants.push(grant.clone());
        Ok(())
    }

    async fn deduct(&mut self, grant_id: GrantId, amount: u64) -> StoreResult<u64> {
        let current = self
            .visible_grants()
            .find(|g| g.id == grant_id)
            .map(|g| self.current_remaining(g))
            .ok_or_else(|| StoreError::GrantNotFound {
                id: grant_id.to_string(),
            })?;

        let remaining = current
            .checked_sub(amount)
            .ok_or(StoreError::Overdrawn {
                requested: amount,
                available: current,
            })?;
        self.staged_remaining.insert(grant_id, remaining);
        Ok(remaining)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            mut book,
            staged_usage,
            staged_grants,
            staged_remaining,
            ..
        } = *self;

        book.grants.extend(staged_grants);
        for grant in book.grants.iter_mut() {
            if let Some(remaining) = staged_remaining.get(&grant.id) {
                grant.remaining = *remaining;
            }
        }
        book.usage.extend(staged_usage);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GrantType, Tier};
    use chrono::Duration;

    async fn store_with_tenant(id: &str) -> (MemoryLedgerStore, TenantId) {
        let store = MemoryLedgerStore::new();
        let tenant = Tenant::new(id, Tier::Guest, Utc::now());
        assert!(store.insert_tenant(&tenant).await.unwrap());
        (store, tenant.id)
    }

    #[tokio::test]
    async fn test_insert_tenant_is_idempotent() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let again = Tenant::new(tenant_id.clone(), Tier::Standard, Utc::now());

        assert!(!store.insert_tenant(&again).await.unwrap());
        let loaded = store.load_tenant(&tenant_id).await.unwrap().unwrap();
        assert_eq!(loaded.tier, Tier::Guest);
        assert_eq!(store.tenant_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_staged_writes() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let now = Utc::now();
        let grant = CreditGrant::new(tenant_id.clone(), 10, GrantType::Trial, None, now);
        store.insert_grant(&grant).await.unwrap();

        let mut tx = store.begin(&tenant_id).await.unwrap();
        let event = UsageEvent::new(tenant_id.clone(), UsageType::AudioGeneration, 4, now);
        tx.append_usage(&event).await.unwrap();
        assert_eq!(tx.deduct(grant.id, 4).await.unwrap(), 6);
        assert_eq!(
            tx.usage_between(UsageType::AudioGeneration, now, now + Duration::seconds(1))
                .await
                .unwrap(),
            4
        );
        tx.commit().await.unwrap();

        let grants = store.list_grants(&tenant_id).await.unwrap();
        assert_eq!(grants[0].remaining, 6);
        let mut tx = store.begin(&tenant_id).await.unwrap();
        let usage = tx
            .usage_by_type(now, now + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(usage.get(&UsageType::AudioGeneration), Some(&4));
        assert_eq!(usage.get(&UsageType::ContextTokens), None);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let now = Utc::now();
        let grant = CreditGrant::new(tenant_id.clone(), 10, GrantType::Trial, None, now);
        store.insert_grant(&grant).await.unwrap();

        {
            let mut tx = store.begin(&tenant_id).await.unwrap();
            tx.append_usage(&UsageEvent::new(
                tenant_id.clone(),
                UsageType::AudioGeneration,
                4,
                now,
            ))
            .await
            .unwrap();
            tx.deduct(grant.id, 4).await.unwrap();
        }

        assert_eq!(store.list_grants(&tenant_id).await.unwrap()[0].remaining, 10);
        assert!(
            store
                .list_usage(&tenant_id, now, now + Duration::seconds(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_grant_added_in_transaction_is_spendable_before_commit() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let grant = CreditGrant::new(tenant_id.clone(), 10, GrantType::Trial, None, Utc::now());

        let mut tx = store.begin(&tenant_id).await.unwrap();
        tx.add_grant(&grant).await.unwrap();
        assert_eq!(tx.grants_for_update().await.unwrap().len(), 1);
        assert_eq!(tx.deduct(grant.id, 7).await.unwrap(), 3);
        tx.commit().await.unwrap();

        let grants = store.list_grants(&tenant_id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].remaining, 3);

        let other = CreditGrant::new(TenantId::from("tenant-b"), 1, GrantType::Trial, None, Utc::now());
        let mut tx = store.begin(&tenant_id).await.unwrap();
        assert!(tx.add_grant(&other).await.is_err());
        tx.rollback().await.unwrap();
        assert_eq!(store.list_grants(&tenant_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deduct_never_goes_below_zero() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let grant = CreditGrant::new(tenant_id.clone(), 10, GrantType::Trial, None, Utc::now());
        store.insert_grant(&grant).await.unwrap();

        let mut tx = store.begin(&tenant_id).await.unwrap();
        assert_eq!(tx.deduct(grant.id, 8).await.unwrap(), 2);
        assert!(matches!(
            tx.deduct(grant.id, 3).await,
            Err(StoreError::Overdrawn {
                requested: 3,
                available: 2
            })
        ));
        assert!(matches!(
            tx.deduct(GrantId::new(), 0).await,
            Err(StoreError::GrantNotFound { .. })
        ));
        tx.commit().await.unwrap();
        assert_eq!(store.list_grants(&tenant_id).await.unwrap()[0].remaining, 2);
    }

    #[tokio::test]
    async fn test_begin_unknown_tenant() {
        let store = MemoryLedgerStore::new();
        let result = store.begin(&TenantId::from("missing")).await;
        assert!(matches!(result, Err(StoreError::TenantNotFound { .. })));
    }

    #[tokio::test]
    async fn test_purge_usage_before() {
        let (store, tenant_id) = store_with_tenant("tenant-a").await;
        let now = Utc::now();
        let mut tx = store.begin(&tenant_id).await.unwrap();
        for days_ago in [10, 5, 1] {
            tx.append_usage(&UsageEvent::new(
                tenant_id.clone(),
                UsageType::ContextTokens,
                100,
                now - Duration::days(days_ago),
            ))
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let purged = store
            .purge_usage_before(&tenant_id, now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        let remaining = store
            .list_usage(&tenant_id, now - Duration::days(30), now)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
    }
}
