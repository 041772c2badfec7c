//! Prelude module for convenient imports.
//!
//! ```rust
//! use credit_ledger::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

// Enforcement
pub use crate::ledger::{QuotaEnforcer, QuotaEnforcerBuilder, RetentionSweep, TrialGrantPolicy};

// Types
pub use crate::types::{
    CreditGrant, DenyReason, GrantType, QuotaDecision, Tenant, TenantId, Tier, UsageSummary,
    UsageType,
};

// Backends
pub use crate::cache::{MemorySummaryCache, SummaryCache};
pub use crate::store::{LedgerStore, StoreFactory};

// Time and limits
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::limits::LimitTable;

// Configuration
pub use crate::config::{ConfigBuilder, LedgerSettings};
