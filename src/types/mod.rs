//! Core ledger types: tenants, credit grants, usage events and decisions.

mod decision;
mod grant;
mod tenant;
mod usage;

pub use decision::{DenyReason, QuotaDecision, UsageSummary, UsageSummaryEntry};
pub use grant::{CreditGrant, GrantId, GrantType};
pub use tenant::{Tenant, TenantId, Tier};
pub use usage::{UsageEvent, UsageEventId, UsageType};
