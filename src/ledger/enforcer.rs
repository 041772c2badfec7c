//! Admission control and atomic debit.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::provision::TrialGrantPolicy;
use super::{credit, usage};
use crate::cache::{CacheConfig, SummaryCache, SummaryCacheLayer};
use crate::clock::{Clock, SystemClock, UsagePeriod};
use crate::config::LedgerSettings;
use crate::limits::LimitTable;
use crate::observability::{ConsumeSpan, MetricsRegistry};
use crate::store::{LedgerStore, LedgerTransaction, StoreError, with_retry};
use crate::types::{
    DenyReason, QuotaDecision, Tenant, TenantId, UsageSummary, UsageSummaryEntry, UsageType,
};
use crate::{Error, Result};

/// Internal retries for store conflicts (serialization failures, deadlocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_conflict_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_conflict_retries: 0,
            ..Self::default()
        }
    }
}

/// Outcome of one transaction attempt, split by whether it may be retried.
enum Attempt {
    Conflict(StoreError),
    Failed(Error),
}

impl Attempt {
    fn is_conflict(&self) -> bool {
        matches!(self, Attempt::Conflict(_))
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attempt::Conflict(e) => write!(f, "{}", e),
            Attempt::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl From<StoreError> for Attempt {
    fn from(err: StoreError) -> Self {
        if err.is_conflict() {
            Attempt::Conflict(err)
        } else {
            Attempt::Failed(err.into())
        }
    }
}

impl From<Error> for Attempt {
    fn from(err: Error) -> Self {
        Attempt::Failed(err)
    }
}

/// Decides whether metered work may run and debits credit for it.
///
/// Cheap to clone; every clone shares the same store, cache and metrics.
#[derive(Clone)]
pub struct QuotaEnforcer {
    pub(super) store: Arc<dyn LedgerStore>,
    pub(super) limits: Arc<LimitTable>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) cache: SummaryCacheLayer,
    pub(super) metrics: Arc<MetricsRegistry>,
    pub(super) retry: RetryPolicy,
    pub(super) trial: TrialGrantPolicy,
}

impl QuotaEnforcer {
    pub fn builder(store: Arc<dyn LedgerStore>) -> QuotaEnforcerBuilder {
        QuotaEnforcerBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Admit and debit `amount` units of `usage_type`, or deny.
    ///
    /// A denial is `Ok` with `admitted == false`. `Err` means nothing was
    /// written.
    pub async fn try_consume(
        &self,
        tenant_id: &TenantId,
        usage_type: UsageType,
        amount: u64,
    ) -> Result<QuotaDecision> {
        self.consume(tenant_id, usage_type, amount, None).await
    }

    /// [`try_consume`](Self::try_consume) with the usage event attributed to a
    /// notebook.
    pub async fn try_consume_for_notebook(
        &self,
        tenant_id: &TenantId,
        usage_type: UsageType,
        amount: u64,
        notebook_id: &str,
    ) -> Result<QuotaDecision> {
        self.consume(tenant_id, usage_type, amount, Some(notebook_id))
            .await
    }

    async fn consume(
        &self,
        tenant_id: &TenantId,
        usage_type: UsageType,
        amount: u64,
        notebook_id: Option<&str>,
    ) -> Result<QuotaDecision> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }

        let span = ConsumeSpan::new(tenant_id, usage_type, amount);
        self.metrics.record_consume_start();

        let retry = self.retry;
        let outcome = with_retry(
            retry.max_conflict_retries,
            retry.initial_backoff,
            retry.max_backoff,
            Attempt::is_conflict,
            || self.consume_once(tenant_id, usage_type, amount, notebook_id),
        )
        .instrument(span.span().clone())
        .await
        .map_err(|attempt| match attempt {
            Attempt::Conflict(e) => Error::unavailable(format!(
                "ledger contention persisted after {} retries: {}",
                retry.max_conflict_retries, e
            )),
            Attempt::Failed(e) => e,
        });

        match outcome {
            Ok(decision) => {
                span.record_decision(&decision);
                let latency_ms = span.finish();
                self.metrics.record_decision(&decision, amount, latency_ms);
                if decision.is_admitted() {
                    self.cache.invalidate(tenant_id).await;
                }
                Ok(decision)
            }
            Err(e) => {
                span.record_error();
                let latency_ms = span.finish();
                self.metrics.record_consume_error(latency_ms);
                tracing::warn!(
                    tenant_id = %tenant_id,
                    usage_type = %usage_type,
                    amount,
                    error = %e,
                    "try_consume failed; nothing was written"
                );
                Err(e)
            }
        }
    }

    async fn consume_once(
        &self,
        tenant_id: &TenantId,
        usage_type: UsageType,
        amount: u64,
        notebook_id: Option<&str>,
    ) -> std::result::Result<QuotaDecision, Attempt> {
        let mut tx = self.store.begin(tenant_id).await?;

        match self
            .decide(tx.as_mut(), usage_type, amount, notebook_id)
            .await
        {
            Ok(decision) if decision.is_admitted() => {
                tx.commit().await?;
                Ok(decision)
            }
            Ok(decision) => {
                release(tx).await;
                Ok(decision)
            }
            Err(e) => {
                release(tx).await;
                Err(e)
            }
        }
    }

    /// Steps between lock acquisition and commit.
    async fn decide(
        &self,
        tx: &mut dyn LedgerTransaction,
        usage_type: UsageType,
        amount: u64,
        notebook_id: Option<&str>,
    ) -> std::result::Result<QuotaDecision, Attempt> {
        let now = self.clock.now();
        let period = UsagePeriod::current(now);
        let tenant = tx.tenant().clone();

        let limit = self.limits.limit(tenant.tier, usage_type)?;
        let used = usage::usage_to_date(tx, usage_type, &period).await?;
        if used.saturating_add(amount) > limit {
            tracing::debug!(used, limit, "Denied: period limit reached");
            return Ok(QuotaDecision::denied(DenyReason::OverPeriodLimit));
        }

        let grants = tx.grants_for_update().await?;
        let available = credit::available_balance(&grants, now);
        if available < amount {
            tracing::debug!(available, "Denied: insufficient credit");
            return Ok(QuotaDecision::denied(DenyReason::InsufficientCredit));
        }

        let event = usage::record_usage(
            tx,
            &tenant.id,
            usage_type,
            amount,
            &period,
            notebook_id.map(str::to_string),
        )
        .await?;

        let plan = match credit::debit(tx, &grants, amount, now).await {
            Ok(plan) => plan,
            Err(StoreError::Overdrawn {
                requested,
                available: held,
            }) => {
                self.metrics.record_consistency_violation();
                tracing::error!(
                    tenant_id = %tenant.id,
                    balance = available,
                    amount,
                    requested,
                    held,
                    "Ledger consistency violation: grants held less than the locked read"
                );
                return Err(Attempt::Failed(Error::InsufficientCredit {
                    requested,
                    available: held,
                }));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(
            event_id = %event.id,
            grants_touched = plan.entries.len(),
            used_after = used + amount,
            limit,
            "Admitted"
        );
        Ok(QuotaDecision::admitted(event.id))
    }

    /// Period-to-date usage, limits and balance. Served from the cache when
    /// possible.
    ///
    /// A miss recomputes under the tenant lock and repopulates the cache before
    /// releasing it, so a concurrent admission's invalidation always lands
    /// after the write.
    pub async fn usage_summary(&self, tenant_id: &TenantId) -> Result<UsageSummary> {
        let now = self.clock.now();
        let period = UsagePeriod::current(now);

        if let Some(summary) = self.cache.get(tenant_id).await
            && summary.period_start == period.start
        {
            return Ok(summary);
        }

        let mut tx = self.store.begin(tenant_id).await?;
        let summary = self.summarize(tx.as_mut(), &period, now).await;
        if let Ok(summary) = &summary {
            self.cache.put(summary).await;
        }
        release(tx).await;
        summary
    }

    async fn summarize(
        &self,
        tx: &mut dyn LedgerTransaction,
        period: &UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageSummary> {
        let tenant = tx.tenant().clone();
        let totals = usage::usage_by_type(tx, period).await?;
        let grants = tx.grants_for_update().await?;

        let mut entries = Vec::with_capacity(UsageType::ALL.len());
        for usage_type in UsageType::ALL {
            entries.push(UsageSummaryEntry {
                usage_type,
                used: totals.get(&usage_type).copied().unwrap_or(0),
                limit: self.limits.limit(tenant.tier, usage_type)?,
            });
        }

        Ok(UsageSummary {
            tenant_id: tenant.id,
            tier: tenant.tier,
            period_start: period.start,
            entries,
            available_credit: credit::available_balance(&grants, now),
        })
    }

    /// Usage events of the current period, for per-notebook attribution.
    pub async fn period_events(&self, tenant_id: &TenantId) -> Result<Vec<crate::types::UsageEvent>> {
        self.require_tenant(tenant_id).await?;
        let period = UsagePeriod::resolve(self.clock.as_ref());
        usage::period_events(self.store.as_ref(), tenant_id, &period).await
    }

    pub(super) async fn require_tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.store
            .load_tenant(tenant_id)
            .await?
            .ok_or_else(|| Error::TenantNotFound {
                tenant_id: tenant_id.clone(),
            })
    }
}

/// Roll back a transaction that must not commit. The lock is released either way.
async fn release(tx: Box<dyn LedgerTransaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "Rollback failed; the store discards the transaction");
    }
}

impl fmt::Debug for QuotaEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaEnforcer")
            .field("store", &self.store.name())
            .field("clock", &self.clock)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("trial", &self.trial)
            .finish()
    }
}

pub struct QuotaEnforcerBuilder {
    store: Arc<dyn LedgerStore>,
    limits: Option<LimitTable>,
    clock: Option<Arc<dyn Clock>>,
    cache: Option<Arc<dyn SummaryCache>>,
    cache_config: CacheConfig,
    metrics: Option<Arc<MetricsRegistry>>,
    retry: RetryPolicy,
    trial: TrialGrantPolicy,
}

impl QuotaEnforcerBuilder {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            limits: None,
            clock: None,
            cache: None,
            cache_config: CacheConfig::default(),
            metrics: None,
            retry: RetryPolicy::default(),
            trial: TrialGrantPolicy::default(),
        }
    }

    /// Apply limits, cache, trial and retry settings. Backends are chosen
    /// separately.
    pub fn settings(mut self, settings: &LedgerSettings) -> Self {
        self.limits = Some(settings.limits.clone());
        self.cache_config = settings.cache.clone();
        self.trial = settings.trial.clone();
        self.retry = settings.retry;
        self
    }

    pub fn limits(mut self, limits: LimitTable) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn SummaryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn trial_policy(mut self, trial: TrialGrantPolicy) -> Self {
        self.trial = trial;
        self
    }

    pub fn build(self) -> QuotaEnforcer {
        let metrics = self.metrics.unwrap_or_default();
        QuotaEnforcer {
            store: self.store,
            limits: Arc::new(self.limits.unwrap_or_default()),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            cache: SummaryCacheLayer::new(self.cache, self.cache_config, Arc::clone(&metrics)),
            metrics,
            retry: self.retry,
            trial: self.trial,
        }
    }
}
