use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TenantId, Tier, UsageEventId, UsageType};

/// Fraction of a limit at which a summary entry is flagged as near the cap.
const NEAR_LIMIT_RATIO: f64 = 0.9;

/// Why an admission check refused a consumption.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    OverPeriodLimit,
    InsufficientCredit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::OverPeriodLimit => "OVER_PERIOD_LIMIT",
            DenyReason::InsufficientCredit => "INSUFFICIENT_CREDIT",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of `QuotaEnforcer::try_consume`.
///
/// Denials are expected business outcomes, not errors. An admitted decision
/// carries the id of the usage event it recorded so that a caller can name it
/// in a compensating refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub admitted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<UsageEventId>,
}

impl QuotaDecision {
    pub fn admitted(event_id: UsageEventId) -> Self {
        Self {
            admitted: true,
            reason: None,
            event_id: Some(event_id),
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        Self {
            admitted: false,
            reason: Some(reason),
            event_id: None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummaryEntry {
    pub usage_type: UsageType,
    pub used: u64,
    pub limit: u64,
}

impl UsageSummaryEntry {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn is_near_limit(&self) -> bool {
        self.used as f64 >= self.limit as f64 * NEAR_LIMIT_RATIO
    }
}

/// Per-tenant period-to-date usage, the payload of the read-through cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub tenant_id: TenantId,
    pub tier: Tier,
    pub period_start: DateTime<Utc>,
    pub entries: Vec<UsageSummaryEntry>,
    pub available_credit: u64,
}

impl UsageSummary {
    pub fn entry(&self, usage_type: UsageType) -> Option<&UsageSummaryEntry> {
        self.entries.iter().find(|e| e.usage_type == usage_type)
    }
}
