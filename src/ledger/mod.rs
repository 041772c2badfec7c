//! The ledger proper: usage events, credit grants and the enforcer that
//! ties them together under one per-tenant transaction.

pub mod credit;
mod enforcer;
mod provision;
mod retention;
pub mod usage;

pub use credit::{DebitEntry, DebitPlan, available_balance, plan_debit};
pub use enforcer::{QuotaEnforcer, QuotaEnforcerBuilder, RetryPolicy};
pub use provision::TrialGrantPolicy;
pub use retention::{RetentionSweep, SweepReport};
