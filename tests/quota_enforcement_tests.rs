//! Quota enforcement tests
//!
//! End-to-end behavior of `QuotaEnforcer` against the memory store: admission
//! decisions, concurrency, all-or-nothing debits, period resets, caching and
//! failure injection.
//!
//! Run: cargo nextest run --test quota_enforcement_tests

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use credit_ledger::store::{LedgerStore, LedgerTransaction, MemoryLedgerStore, StoreError, StoreResult};
use credit_ledger::{
    CreditGrant, DenyReason, Error, GrantId, GrantType, ManualClock, QuotaEnforcer, RetryPolicy,
    Tenant, TenantId, Tier, UsageEvent, UsageType,
};

fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_retry(max: u32) -> RetryPolicy {
    RetryPolicy {
        max_conflict_retries: max,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

async fn tenant_with_credit(
    store: &dyn LedgerStore,
    id: &str,
    tier: Tier,
    grants: &[(u64, Option<DateTime<Utc>>)],
    now: DateTime<Utc>,
) -> (TenantId, Vec<CreditGrant>) {
    let tenant = TenantId::new(id);
    store
        .insert_tenant(&Tenant::new(tenant.clone(), tier, now))
        .await
        .unwrap();
    let mut created = Vec::new();
    for (amount, expires_at) in grants {
        let grant = CreditGrant::new(tenant.clone(), *amount, GrantType::Purchased, *expires_at, now);
        store.insert_grant(&grant).await.unwrap();
        created.push(grant);
    }
    (tenant, created)
}

async fn total_remaining(store: &dyn LedgerStore, tenant: &TenantId) -> u64 {
    store
        .list_grants(tenant)
        .await
        .unwrap()
        .iter()
        .map(|g| g.remaining)
        .sum()
}

async fn all_usage(store: &dyn LedgerStore, tenant: &TenantId) -> Vec<UsageEvent> {
    store
        .list_usage(tenant, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
        .await
        .unwrap()
}

// =============================================================================
// Admission decisions
// =============================================================================

mod admission_tests {
    use super::*;
    use credit_ledger::Clock;

    #[tokio::test]
    async fn test_guest_audio_scenario() {
        let clock = Arc::new(ManualClock::new(at("2026-02-10T09:00:00Z")));
        let store = Arc::new(MemoryLedgerStore::new());
        let enforcer = QuotaEnforcer::builder(store.clone())
            .clock(clock.clone())
            .build();
        let tenant = TenantId::new("anon-42");
        enforcer.register_tenant(&tenant, Tier::Guest).await.unwrap();

        let first = enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 8)
            .await
            .unwrap();
        assert!(first.is_admitted());

        let over = enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 3)
            .await
            .unwrap();
        assert!(!over.admitted);
        assert_eq!(over.reason, Some(DenyReason::OverPeriodLimit));
        assert_eq!(over.event_id, None);

        let fits = enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 2)
            .await
            .unwrap();
        assert!(fits.is_admitted());

        let summary = enforcer.usage_summary(&tenant).await.unwrap();
        let audio = summary.entry(UsageType::AudioGeneration).unwrap();
        assert_eq!(audio.used, 10);
        assert_eq!(audio.limit, 10);
        assert!(audio.is_exhausted());
        assert!(audio.is_near_limit());
        assert_eq!(summary.available_credit, 0);
    }

    #[tokio::test]
    async fn test_insufficient_credit_is_a_denial() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Standard, &[(3, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let decision = enforcer
            .try_consume(&tenant, UsageType::DocumentProcessing, 4)
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(DenyReason::InsufficientCredit));
        assert!(all_usage(store.as_ref(), &tenant).await.is_empty());
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 3);
    }

    #[tokio::test]
    async fn test_expired_credit_is_not_spendable() {
        let clock = Arc::new(ManualClock::new(at("2026-02-10T09:00:00Z")));
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Standard,
            &[(20, Some(at("2026-02-11T00:00:00Z")))],
            clock.now(),
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone())
            .clock(clock.clone())
            .build();

        assert!(
            enforcer
                .try_consume(&tenant, UsageType::ImageGeneration, 1)
                .await
                .unwrap()
                .is_admitted()
        );

        clock.set(at("2026-02-11T00:00:00Z"));
        let decision = enforcer
            .try_consume(&tenant, UsageType::ImageGeneration, 1)
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(DenyReason::InsufficientCredit));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let enforcer = QuotaEnforcer::builder(Arc::new(MemoryLedgerStore::new())).build();
        let tenant = TenantId::new("t-1");
        enforcer.register_tenant(&tenant, Tier::Guest).await.unwrap();

        assert!(matches!(
            enforcer.try_consume(&tenant, UsageType::ContextTokens, 0).await,
            Err(Error::InvalidAmount)
        ));

        let err = enforcer
            .try_consume(&TenantId::new("unknown"), UsageType::ContextTokens, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TenantNotFound { .. }));
        assert!(!err.is_retryable());
    }
}

// =============================================================================
// Credit pool ordering and conservation
// =============================================================================

mod credit_tests {
    use super::*;

    #[tokio::test]
    async fn test_expiring_grant_drained_first() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, grants) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Standard,
            &[(100, None), (5, Some(now + chrono::Duration::days(1)))],
            now,
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        assert!(
            enforcer
                .try_consume(&tenant, UsageType::DocumentProcessing, 5)
                .await
                .unwrap()
                .is_admitted()
        );

        let after: HashMap<GrantId, u64> = store
            .list_grants(&tenant)
            .await
            .unwrap()
            .into_iter()
            .map(|g| (g.id, g.remaining))
            .collect();
        assert_eq!(after[&grants[0].id], 100);
        assert_eq!(after[&grants[1].id], 0);
    }

    #[tokio::test]
    async fn test_debit_spans_grants() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Standard,
            &[(4, Some(now + chrono::Duration::days(2))), (4, None)],
            now,
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();
        enforcer
            .grant_credit(&tenant, 2, GrantType::Trial, Some(now + chrono::Duration::days(2)))
            .await
            .unwrap();

        assert!(
            enforcer
                .try_consume(&tenant, UsageType::ContextTokens, 7)
                .await
                .unwrap()
                .is_admitted()
        );

        let mut remaining: Vec<(GrantType, Option<DateTime<Utc>>, u64)> = store
            .list_grants(&tenant)
            .await
            .unwrap()
            .into_iter()
            .map(|g| (g.grant_type, g.expires_at, g.remaining))
            .collect();
        remaining.sort_by_key(|(_, _, r)| *r);
        assert_eq!(remaining[0].2, 0);
        assert_eq!(remaining[1].2, 0);
        assert_eq!(remaining[2], (GrantType::Purchased, None, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_conservation_under_concurrency() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Standard,
            &[(30, Some(now + chrono::Duration::days(3))), (50, None)],
            now,
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let mut handles = Vec::new();
        for i in 0..40u64 {
            let enforcer = enforcer.clone();
            let tenant = tenant.clone();
            let amount = i % 7 + 1;
            handles.push(tokio::spawn(async move {
                let decision = enforcer
                    .try_consume(&tenant, UsageType::ContextTokens, amount)
                    .await
                    .unwrap();
                if decision.is_admitted() { amount } else { 0 }
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            admitted += handle.await.unwrap();
        }

        let remaining = total_remaining(store.as_ref(), &tenant).await;
        let recorded: u64 = all_usage(store.as_ref(), &tenant)
            .await
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(admitted + remaining, 80);
        assert_eq!(recorded, admitted);
        assert!(admitted > 0);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_racing_calls_at_limit_edge() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Guest, &[(100, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();
        enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 9)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            enforcer.try_consume(&tenant, UsageType::AudioGeneration, 1),
            enforcer.try_consume(&tenant, UsageType::AudioGeneration, 1),
        );
        let decisions = [a.unwrap(), b.unwrap()];
        assert_eq!(decisions.iter().filter(|d| d.is_admitted()).count(), 1);
        assert!(
            decisions
                .iter()
                .any(|d| d.reason == Some(DenyReason::OverPeriodLimit))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_overshoot_with_many_tasks() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Guest, &[(1000, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let calls = (0..50).map(|_| {
            let enforcer = enforcer.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                enforcer
                    .try_consume(&tenant, UsageType::DocumentProcessing, 1)
                    .await
                    .unwrap()
            })
        });
        let decisions = futures::future::join_all(calls).await;
        let admitted = decisions
            .into_iter()
            .map(|d| d.unwrap())
            .filter(|d| d.is_admitted())
            .count();

        assert_eq!(admitted, 20);
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 980);
        assert_eq!(enforcer.metrics().denied_over_limit.get(), 30);
    }

    #[tokio::test]
    async fn test_tenants_do_not_block_each_other() {
        let now = Utc::now();
        let store = Arc::new(MemoryLedgerStore::new());
        let (busy, _) =
            tenant_with_credit(store.as_ref(), "busy", Tier::Guest, &[(10, None)], now).await;
        let (free, _) =
            tenant_with_credit(store.as_ref(), "free", Tier::Guest, &[(10, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let held = store.begin(&busy).await.unwrap();

        let decision = tokio::time::timeout(
            Duration::from_secs(1),
            enforcer.try_consume(&free, UsageType::AudioGeneration, 1),
        )
        .await
        .expect("other tenant must not wait on the held lock")
        .unwrap();
        assert!(decision.is_admitted());

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            enforcer.try_consume(&busy, UsageType::AudioGeneration, 1),
        )
        .await;
        assert!(blocked.is_err());

        held.rollback().await.unwrap();
        assert!(
            enforcer
                .try_consume(&busy, UsageType::AudioGeneration, 1)
                .await
                .unwrap()
                .is_admitted()
        );
    }
}

// =============================================================================
// Period reset
// =============================================================================

mod period_tests {
    use super::*;

    #[tokio::test]
    async fn test_limit_resets_at_month_boundary() {
        let clock = Arc::new(ManualClock::new(at("2026-01-31T23:59:00Z")));
        let store = Arc::new(MemoryLedgerStore::new());
        let (tenant, _) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Guest,
            &[(100, None)],
            at("2026-01-01T00:00:00Z"),
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone())
            .clock(clock.clone())
            .build();

        assert!(
            enforcer
                .try_consume(&tenant, UsageType::ImageGeneration, 5)
                .await
                .unwrap()
                .is_admitted()
        );
        let denied = enforcer
            .try_consume(&tenant, UsageType::ImageGeneration, 1)
            .await
            .unwrap();
        assert_eq!(denied.reason, Some(DenyReason::OverPeriodLimit));

        clock.set(at("2026-02-01T00:00:00Z"));
        assert!(
            enforcer
                .try_consume(&tenant, UsageType::ImageGeneration, 5)
                .await
                .unwrap()
                .is_admitted()
        );

        let summary = enforcer.usage_summary(&tenant).await.unwrap();
        assert_eq!(summary.period_start, at("2026-02-01T00:00:00Z"));
        assert_eq!(summary.entry(UsageType::ImageGeneration).unwrap().used, 5);
        assert_eq!(summary.available_credit, 90);
    }
}

// =============================================================================
// Failure injection
// =============================================================================

mod failure_tests {
    use super::*;

    /// Wraps the memory store and injects failures into its transactions.
    struct FlakyStore {
        inner: MemoryLedgerStore,
        /// Fail the n-th `deduct` call of every transaction (1-based, 0 = never).
        fail_debit_at: u32,
        /// Remaining commits that report a conflict.
        conflicts: AtomicU32,
        /// Added to every grant returned by the locked read.
        inflate_grants: u64,
    }

    impl FlakyStore {
        fn new(fail_debit_at: u32, conflicts: u32) -> Self {
            Self {
                inner: MemoryLedgerStore::new(),
                fail_debit_at,
                conflicts: AtomicU32::new(conflicts),
                inflate_grants: 0,
            }
        }

        fn with_stale_grants(mut self, inflate: u64) -> Self {
            self.inflate_grants = inflate;
            self
        }
    }

    struct FlakyTransaction {
        inner: Box<dyn LedgerTransaction>,
        fail_debit_at: u32,
        debits: u32,
        conflict_on_commit: bool,
        inflate_grants: u64,
    }

    #[async_trait::async_trait]
    impl LedgerTransaction for FlakyTransaction {
        fn tenant(&self) -> &Tenant {
            self.inner.tenant()
        }

        async fn usage_between(
            &mut self,
            usage_type: UsageType,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.usage_between(usage_type, start, end).await
        }

        async fn usage_by_type(
            &mut self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StoreResult<HashMap<UsageType, u64>> {
            self.inner.usage_by_type(start, end).await
        }

        async fn grants_for_update(&mut self) -> StoreResult<Vec<CreditGrant>> {
            let mut grants = self.inner.grants_for_update().await?;
            for grant in grants.iter_mut() {
                grant.remaining += self.inflate_grants;
            }
            Ok(grants)
        }

        async fn append_usage(&mut self, event: &UsageEvent) -> StoreResult<()> {
            self.inner.append_usage(event).await
        }

        async fn add_grant(&mut self, grant: &CreditGrant) -> StoreResult<()> {
            self.inner.add_grant(grant).await
        }

        async fn deduct(&mut self, grant_id: GrantId, amount: u64) -> StoreResult<u64> {
            self.debits += 1;
            if self.debits == self.fail_debit_at {
                return Err(StoreError::Storage {
                    message: "connection reset by peer".into(),
                });
            }
            self.inner.deduct(grant_id, amount).await
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            if self.conflict_on_commit {
                self.inner.rollback().await?;
                return Err(StoreError::Conflict {
                    message: "could not serialize access".into(),
                });
            }
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> StoreResult<()> {
            self.inner.rollback().await
        }
    }

    #[async_trait::async_trait]
    impl LedgerStore for FlakyStore {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn insert_tenant(&self, tenant: &Tenant) -> StoreResult<bool> {
            self.inner.insert_tenant(tenant).await
        }

        async fn load_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
            self.inner.load_tenant(id).await
        }

        async fn insert_grant(&self, grant: &CreditGrant) -> StoreResult<()> {
            self.inner.insert_grant(grant).await
        }

        async fn list_grants(&self, tenant_id: &TenantId) -> StoreResult<Vec<CreditGrant>> {
            self.inner.list_grants(tenant_id).await
        }

        async fn list_usage(
            &self,
            tenant_id: &TenantId,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StoreResult<Vec<UsageEvent>> {
            self.inner.list_usage(tenant_id, start, end).await
        }

        async fn purge_usage_before(
            &self,
            tenant_id: &TenantId,
            cutoff: DateTime<Utc>,
        ) -> StoreResult<u64> {
            self.inner.purge_usage_before(tenant_id, cutoff).await
        }

        async fn begin(&self, tenant_id: &TenantId) -> StoreResult<Box<dyn LedgerTransaction>> {
            let inner = self.inner.begin(tenant_id).await?;
            let conflict_on_commit = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(FlakyTransaction {
                inner,
                fail_debit_at: self.fail_debit_at,
                debits: 0,
                conflict_on_commit,
                inflate_grants: self.inflate_grants,
            }))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_mid_debit_writes_nothing() {
        init_tracing();
        let now = Utc::now();
        let store = Arc::new(FlakyStore::new(2, 0));
        let (tenant, _) = tenant_with_credit(
            store.as_ref(),
            "t-1",
            Tier::Standard,
            &[(3, Some(now + chrono::Duration::days(1))), (10, None)],
            now,
        )
        .await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let err = enforcer
            .try_consume(&tenant, UsageType::DocumentProcessing, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LedgerUnavailable { .. }));
        assert!(err.is_retryable());

        assert!(all_usage(store.as_ref(), &tenant).await.is_empty());
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 13);
        assert_eq!(enforcer.metrics().consume_errors.get(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        init_tracing();
        let now = Utc::now();
        let store = Arc::new(FlakyStore::new(0, 2));
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Standard, &[(10, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone())
            .retry(fast_retry(3))
            .build();

        let decision = enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 4)
            .await
            .unwrap();
        assert!(decision.is_admitted());
        assert_eq!(all_usage(store.as_ref(), &tenant).await.len(), 1);
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 6);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_as_unavailable() {
        init_tracing();
        let now = Utc::now();
        let store = Arc::new(FlakyStore::new(0, 10));
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Standard, &[(10, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone())
            .retry(fast_retry(2))
            .build();

        let err = enforcer
            .try_consume(&tenant, UsageType::AudioGeneration, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LedgerUnavailable { .. }));
        assert!(all_usage(store.as_ref(), &tenant).await.is_empty());
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 10);
    }

    #[tokio::test]
    async fn test_stale_grant_read_is_a_consistency_violation() {
        init_tracing();
        let now = Utc::now();
        let store = Arc::new(FlakyStore::new(0, 0).with_stale_grants(10));
        let (tenant, _) =
            tenant_with_credit(store.as_ref(), "t-1", Tier::Standard, &[(2, None)], now).await;
        let enforcer = QuotaEnforcer::builder(store.clone()).build();

        let err = enforcer
            .try_consume(&tenant, UsageType::DocumentProcessing, 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientCredit {
                requested: 5,
                available: 2
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(enforcer.metrics().consistency_violations.get(), 1);
        assert_eq!(enforcer.metrics().consume_errors.get(), 1);

        assert!(all_usage(store.as_ref(), &tenant).await.is_empty());
        assert_eq!(total_remaining(store.as_ref(), &tenant).await, 2);
    }
}
