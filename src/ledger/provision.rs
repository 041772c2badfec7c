//! Tenant registration and credit grants.

use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::enforcer::QuotaEnforcer;
use crate::observability::tenant_span;
use crate::types::{CreditGrant, GrantType, Tenant, TenantId, Tier};
use crate::{Error, Result};

/// Credit handed to every new guest tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialGrantPolicy {
    pub enabled: bool,
    pub amount: u64,
    /// Measured from the tenant's creation.
    pub ttl: chrono::Duration,
}

impl Default for TrialGrantPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            amount: 10,
            ttl: chrono::Duration::days(7),
        }
    }
}

impl TrialGrantPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// The trial grant `tenant` is entitled to, if any. A guest whose trial
    /// window already closed gets none.
    pub fn grant_for(&self, tenant: &Tenant, now: DateTime<Utc>) -> Option<CreditGrant> {
        if !self.enabled || self.amount == 0 || !tenant.is_guest() {
            return None;
        }
        let expires_at = tenant.created_at.checked_add_signed(self.ttl)?;
        if expires_at <= now {
            return None;
        }
        Some(CreditGrant::new(
            tenant.id.clone(),
            self.amount,
            GrantType::Trial,
            Some(expires_at),
            now,
        ))
    }
}

impl QuotaEnforcer {
    /// Create the tenant if missing and issue its trial bundle.
    ///
    /// Idempotent: an existing tenant keeps its tier, and a guest that already
    /// holds a trial grant (even an exhausted one) gets no second one.
    pub async fn register_tenant(&self, tenant_id: &TenantId, tier: Tier) -> Result<Tenant> {
        async {
            let now = self.clock.now();
            let created = self
                .store
                .insert_tenant(&Tenant::new(tenant_id.clone(), tier, now))
                .await?;

            let mut tx = self.store.begin(tenant_id).await?;
            let tenant = tx.tenant().clone();
            if !created && tenant.tier != tier {
                tracing::warn!(
                    stored = %tenant.tier,
                    requested = %tier,
                    "Tenant already registered with a different tier; keeping the stored tier"
                );
            }

            let mut trial_issued = false;
            if let Some(trial) = self.trial.grant_for(&tenant, now) {
                let grants = tx.grants_for_update().await?;
                if !grants.iter().any(|g| g.grant_type == GrantType::Trial) {
                    tx.add_grant(&trial).await?;
                    trial_issued = true;
                }
            }
            tx.commit().await?;

            if created || trial_issued {
                self.cache.invalidate(tenant_id).await;
            }
            tracing::info!(created, trial_issued, tier = %tenant.tier, "Tenant registered");
            Ok::<_, Error>(tenant)
        }
        .instrument(tenant_span("register_tenant", tenant_id))
        .await
    }

    /// Create a new grant. Existing grants are never topped up.
    pub async fn grant_credit(
        &self,
        tenant_id: &TenantId,
        amount: u64,
        grant_type: GrantType,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreditGrant> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }

        async {
            let now = self.clock.now();
            if expires_at.is_some_and(|at| at <= now) {
                tracing::warn!(?expires_at, "Granting credit that is already expired");
            }
            let grant = CreditGrant::new(tenant_id.clone(), amount, grant_type, expires_at, now);

            let mut tx = self.store.begin(tenant_id).await?;
            tx.add_grant(&grant).await?;
            tx.commit().await?;

            self.cache.invalidate(tenant_id).await;
            tracing::info!(grant_id = %grant.id, amount, grant_type = %grant_type, "Credit granted");
            Ok::<_, Error>(grant)
        }
        .instrument(tenant_span("grant_credit", tenant_id))
        .await
    }

    /// Every grant of the tenant, including exhausted and expired ones.
    pub async fn credit_grants(&self, tenant_id: &TenantId) -> Result<Vec<CreditGrant>> {
        self.require_tenant(tenant_id).await?;
        Ok(self.store.list_grants(tenant_id).await?)
    }

    /// Spendable balance right now, read without the tenant lock.
    pub async fn available_credit(&self, tenant_id: &TenantId) -> Result<u64> {
        let grants = self.credit_grants(tenant_id).await?;
        Ok(super::credit::available_balance(&grants, self.clock.now()))
    }
}
