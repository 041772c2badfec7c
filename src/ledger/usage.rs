//! Append-only usage ledger.
//!
//! Usage events are the source of truth for period-to-date consumption. They
//! are written once inside the enforcer's transaction and only ever removed by
//! the retention sweep.

use std::collections::HashMap;

use crate::Result;
use crate::clock::UsagePeriod;
use crate::store::{LedgerStore, LedgerTransaction, StoreResult};
use crate::types::{TenantId, UsageEvent, UsageType};

/// Append a usage event stamped at `period.end` inside `tx`.
///
/// Store errors are returned as-is so the caller can tell a lost lock race
/// from an outage.
pub async fn record_usage(
    tx: &mut dyn LedgerTransaction,
    tenant_id: &TenantId,
    usage_type: UsageType,
    amount: u64,
    period: &UsagePeriod,
    notebook_id: Option<String>,
) -> StoreResult<UsageEvent> {
    let event = UsageEvent::new(tenant_id.clone(), usage_type, amount, period.end)
        .with_notebook(notebook_id);
    tx.append_usage(&event).await?;
    Ok(event)
}

/// Units of `usage_type` consumed in the current period, read under the
/// tenant lock held by `tx`.
pub async fn usage_to_date(
    tx: &mut dyn LedgerTransaction,
    usage_type: UsageType,
    period: &UsagePeriod,
) -> StoreResult<u64> {
    tx.usage_between(usage_type, period.start, period.reset_at())
        .await
}

/// Per-type totals for the period, read under the tenant lock held by `tx`.
///
/// Types with no events are absent from the map.
pub async fn usage_by_type(
    tx: &mut dyn LedgerTransaction,
    period: &UsagePeriod,
) -> StoreResult<HashMap<UsageType, u64>> {
    tx.usage_by_type(period.start, period.reset_at()).await
}

/// Events of the period in creation order, for attribution reports.
pub async fn period_events(
    store: &dyn LedgerStore,
    tenant_id: &TenantId,
    period: &UsagePeriod,
) -> Result<Vec<UsageEvent>> {
    Ok(store
        .list_usage(tenant_id, period.start, period.reset_at())
        .await?)
}
