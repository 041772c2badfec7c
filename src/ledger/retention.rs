//! Per-tier usage history retention.
//!
//! An external scheduler calls [`RetentionSweep::sweep`] per tenant. Events of
//! the current period are never purged, whatever the retention window says,
//! because they back the period-to-date totals.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::enforcer::QuotaEnforcer;
use crate::clock::{Clock, UsagePeriod};
use crate::limits::LimitTable;
use crate::observability::tenant_span;
use crate::store::LedgerStore;
use crate::types::TenantId;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub tenant_id: TenantId,
    /// Events strictly before this instant were purged. `None` when the tier
    /// keeps history forever.
    pub cutoff: Option<DateTime<Utc>>,
    pub purged: u64,
}

#[derive(Clone)]
pub struct RetentionSweep {
    store: Arc<dyn LedgerStore>,
    limits: Arc<LimitTable>,
    clock: Arc<dyn Clock>,
}

impl RetentionSweep {
    pub fn new(store: Arc<dyn LedgerStore>, limits: Arc<LimitTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
        }
    }

    /// The cutoff for a retention window at `now`, clamped to the start of the
    /// current period.
    pub fn cutoff(retention: chrono::Duration, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = UsagePeriod::current(now);
        now.checked_sub_signed(retention)
            .map_or(period.start, |at| at.min(period.start))
    }

    pub async fn sweep(&self, tenant_id: &TenantId) -> Result<SweepReport> {
        async {
            let tenant = self
                .store
                .load_tenant(tenant_id)
                .await?
                .ok_or_else(|| Error::TenantNotFound {
                    tenant_id: tenant_id.clone(),
                })?;

            let Some(retention) = self.limits.retention(tenant.tier) else {
                tracing::debug!(tier = %tenant.tier, "No retention window; keeping history");
                return Ok(SweepReport {
                    tenant_id: tenant.id,
                    cutoff: None,
                    purged: 0,
                });
            };

            let cutoff = Self::cutoff(retention, self.clock.now());
            let purged = self.store.purge_usage_before(tenant_id, cutoff).await?;
            if purged > 0 {
                tracing::info!(purged, %cutoff, "Purged usage history");
            }
            Ok::<_, Error>(SweepReport {
                tenant_id: tenant.id,
                cutoff: Some(cutoff),
                purged,
            })
        }
        .instrument(tenant_span("retention_sweep", tenant_id))
        .await
    }

    /// Sweep several tenants concurrently, continuing past failures. Reports
    /// come back in input order.
    pub async fn sweep_all(&self, tenant_ids: &[TenantId]) -> Vec<Result<SweepReport>> {
        let reports = join_all(tenant_ids.iter().map(|id| self.sweep(id))).await;
        for (tenant_id, report) in tenant_ids.iter().zip(&reports) {
            if let Err(e) = report {
                tracing::warn!(tenant_id = %tenant_id, error = %e, "Retention sweep failed");
            }
        }
        reports
    }
}

impl std::fmt::Debug for RetentionSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweep")
            .field("store", &self.store.name())
            .field("clock", &self.clock)
            .finish()
    }
}

impl QuotaEnforcer {
    /// A sweep sharing this enforcer's store, limits and clock.
    pub fn retention_sweep(&self) -> RetentionSweep {
        RetentionSweep::new(
            Arc::clone(&self.store),
            Arc::clone(&self.limits),
            Arc::clone(&self.clock),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::usage;
    use crate::store::MemoryLedgerStore;
    use crate::types::{Tenant, Tier, UsageType};
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    async fn record_at(store: &MemoryLedgerStore, tenant: &TenantId, when: DateTime<Utc>) {
        let mut tx = store.begin(tenant).await.unwrap();
        usage::record_usage(
            tx.as_mut(),
            tenant,
            UsageType::DocumentProcessing,
            1,
            &UsagePeriod::current(when),
            None,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[test]
    fn test_cutoff_never_enters_current_period() {
        let now = at("2026-06-03T10:00:00Z");
        assert_eq!(
            RetentionSweep::cutoff(Duration::days(7), now),
            at("2026-05-27T10:00:00Z")
        );

        let mid_month = at("2026-06-20T10:00:00Z");
        assert_eq!(
            RetentionSweep::cutoff(Duration::days(7), mid_month),
            at("2026-06-01T00:00:00Z")
        );
    }

    #[tokio::test]
    async fn test_sweep_purges_only_outside_window_and_period() {
        let now = at("2026-06-20T10:00:00Z");
        let store = Arc::new(MemoryLedgerStore::new());
        let tenant = TenantId::new("anon-1");
        store
            .insert_tenant(&Tenant::new(tenant.clone(), Tier::Guest, at("2026-04-01T00:00:00Z")))
            .await
            .unwrap();

        record_at(&store, &tenant, at("2026-04-10T00:00:00Z")).await;
        record_at(&store, &tenant, at("2026-05-31T23:00:00Z")).await;
        record_at(&store, &tenant, at("2026-06-02T08:00:00Z")).await;
        record_at(&store, &tenant, now).await;

        let sweep = RetentionSweep::new(
            store.clone(),
            Arc::new(LimitTable::default()),
            Arc::new(ManualClock::new(now)),
        );
        let report = sweep.sweep(&tenant).await.unwrap();
        assert_eq!(report.purged, 2);
        assert_eq!(report.cutoff, Some(at("2026-06-01T00:00:00Z")));

        let remaining = store
            .list_usage(&tenant, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_without_retention_keeps_everything() {
        let now = at("2026-06-20T10:00:00Z");
        let store = Arc::new(MemoryLedgerStore::new());
        let tenant = TenantId::new("acct-1");
        store
            .insert_tenant(&Tenant::new(tenant.clone(), Tier::Standard, now))
            .await
            .unwrap();
        record_at(&store, &tenant, at("2025-01-01T00:00:00Z")).await;

        let limits = LimitTable::builder()
            .limit(Tier::Standard, UsageType::DocumentProcessing, 100)
            .build();
        let sweep = RetentionSweep::new(store, Arc::new(limits), Arc::new(ManualClock::new(now)));

        let reports = sweep
            .sweep_all(&[tenant.clone(), TenantId::new("ghost")])
            .await;
        assert_eq!(reports.len(), 2);
        let first = reports[0].as_ref().unwrap();
        assert_eq!(first.cutoff, None);
        assert_eq!(first.purged, 0);
        assert!(matches!(reports[1], Err(Error::TenantNotFound { .. })));
    }
}
