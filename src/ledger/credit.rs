//! Credit pool: balance computation and priority-ordered debits.
//!
//! Grants are drained in a fixed order:
//!
//! 1. soonest expiry first, grants without an expiry last
//! 2. then by grant type (`TRIAL`, `PURCHASED`, `PROMOTIONAL`)
//! 3. then by creation time, then by id
//!
//! A debit either takes exactly the requested amount or touches nothing.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{LedgerTransaction, StoreError, StoreResult};
use crate::types::{CreditGrant, GrantId};
use crate::{Error, Result};

/// Spendable credit at `now`: the sum of `remaining` over unexpired grants.
pub fn available_balance(grants: &[CreditGrant], now: DateTime<Utc>) -> u64 {
    grants
        .iter()
        .filter(|g| !g.is_expired(now))
        .fold(0u64, |acc, g| acc.saturating_add(g.remaining))
}

fn debit_order(a: &CreditGrant, b: &CreditGrant) -> Ordering {
    a.expires_at
        .is_none()
        .cmp(&b.expires_at.is_none())
        .then_with(|| a.expires_at.cmp(&b.expires_at))
        .then_with(|| a.grant_type.cmp(&b.grant_type))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitEntry {
    pub grant_id: GrantId,
    pub deducted: u64,
    pub remaining_after: u64,
}

/// The per-grant split of one debit, in the order it is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitPlan {
    pub entries: Vec<DebitEntry>,
}

impl DebitPlan {
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|e| e.deducted).sum()
    }

    pub fn touches(&self, grant_id: GrantId) -> bool {
        self.entries.iter().any(|e| e.grant_id == grant_id)
    }
}

/// Compute how `amount` would be split across `grants` without mutating
/// anything.
pub fn plan_debit(grants: &[CreditGrant], amount: u64, now: DateTime<Utc>) -> Result<DebitPlan> {
    let available = available_balance(grants, now);
    if available < amount {
        return Err(Error::InsufficientCredit {
            requested: amount,
            available,
        });
    }

    let mut eligible: Vec<&CreditGrant> = grants.iter().filter(|g| g.is_spendable(now)).collect();
    eligible.sort_by(|a, b| debit_order(a, b));

    let mut owed = amount;
    let mut entries = Vec::new();
    for grant in eligible {
        if owed == 0 {
            break;
        }
        let take = grant.remaining.min(owed);
        owed -= take;
        entries.push(DebitEntry {
            grant_id: grant.id,
            deducted: take,
            remaining_after: grant.remaining - take,
        });
    }

    Ok(DebitPlan { entries })
}

/// Plan a debit from the locked `grants` read and deduct it inside `tx`.
///
/// Fails with [`StoreError::Overdrawn`] when `grants` cannot cover `amount`,
/// before any write, or when a grant turns out to hold less than `grants`
/// said. The transaction must then be rolled back. Other store errors are
/// returned unchanged so conflicts stay retryable.
pub async fn debit(
    tx: &mut dyn LedgerTransaction,
    grants: &[CreditGrant],
    amount: u64,
    now: DateTime<Utc>,
) -> StoreResult<DebitPlan> {
    let mut plan = plan_debit(grants, amount, now).map_err(|_| StoreError::Overdrawn {
        requested: amount,
        available: available_balance(grants, now),
    })?;
    for entry in plan.entries.iter_mut() {
        entry.remaining_after = tx.deduct(entry.grant_id, entry.deducted).await?;
    }
    Ok(plan)
}
