//! # credit-ledger
//!
//! Credit metering and quota enforcement for multi-tenant notebook workloads.
//!
//! Every metered operation (chat context tokens, audio overviews, document
//! processing, image generation) asks the [`QuotaEnforcer`] for admission
//! first. The enforcer checks the tenant's period limit and credit balance and
//! debits credit grants inside one per-tenant transaction, so concurrent
//! requests can never overshoot a limit or spend the same credit twice.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use credit_ledger::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let enforcer = QuotaEnforcer::builder(StoreFactory::memory()).build();
//!
//!     let tenant = TenantId::new("anon-7f3c");
//!     enforcer.register_tenant(&tenant, Tier::Guest).await?;
//!
//!     let decision = enforcer
//!         .try_consume(&tenant, UsageType::AudioGeneration, 1)
//!         .await?;
//!     if decision.is_admitted() {
//!         // run the metered work
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Backends
//!
//! - `postgres`: [`store::PostgresLedgerStore`] with row locks per tenant
//! - `redis-backend`: [`cache::RedisSummaryCache`] for usage summaries
//! - `otel`: OpenTelemetry export of spans and ledger metrics

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod limits;
pub mod observability;
pub mod prelude;
pub mod store;
pub mod types;

pub use cache::{CacheConfig, MemorySummaryCache, SummaryCache, SummaryCacheLayer};
pub use clock::{Clock, ManualClock, SystemClock, UsagePeriod};
pub use config::{ConfigBuilder, ConfigError, ConfigProvider, LedgerSettings};
pub use ledger::{
    DebitEntry, DebitPlan, QuotaEnforcer, QuotaEnforcerBuilder, RetentionSweep, RetryPolicy,
    SweepReport, TrialGrantPolicy,
};
pub use limits::{LimitTable, LimitTableBuilder, LimitsDocument};
pub use observability::{MetricsRegistry, MetricsSummary, ObservabilityConfig};
pub use store::{LedgerStore, LedgerTransaction, MemoryLedgerStore, StoreError, StoreFactory};
pub use types::{
    CreditGrant, DenyReason, GrantId, GrantType, QuotaDecision, Tenant, TenantId, Tier,
    UsageEvent, UsageEventId, UsageSummary, UsageSummaryEntry, UsageType,
};

/// Error type for ledger operations.
///
/// Quota denials are not errors; they come back as [`QuotaDecision`] values.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No limit is configured for this tier and usage type.
    #[error("No limit configured for {tier} / {usage_type}")]
    Configuration { tier: Tier, usage_type: UsageType },

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Consumption amount must be positive")]
    InvalidAmount,

    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    /// The ledger store failed or stayed contended; the transaction was rolled back.
    #[error("Ledger unavailable: {message}")]
    LedgerUnavailable { message: String },

    /// Eligible grants could not cover a debit.
    #[error("Insufficient credit: requested {requested}, available {available}")]
    InsufficientCredit { requested: u64, available: u64 },
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing limits, bad settings, invalid arguments
    Configuration,
    /// Unknown tenant
    NotFound,
    /// Store outages and exhausted conflict retries
    Transient,
    /// Ledger state disagreed with an earlier read in the same transaction
    Consistency,
}

impl Error {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Error::LedgerUnavailable {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration { .. } | Error::Config(_) | Error::InvalidAmount => {
                ErrorCategory::Configuration
            }
            Error::TenantNotFound { .. } => ErrorCategory::NotFound,
            Error::LedgerUnavailable { .. } => ErrorCategory::Transient,
            Error::InsufficientCredit { .. } => ErrorCategory::Consistency,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Consistency
        )
    }
}

impl From<store::StoreError> for Error {
    fn from(err: store::StoreError) -> Self {
        match err {
            store::StoreError::TenantNotFound { id } => Error::TenantNotFound {
                tenant_id: TenantId::new(id),
            },
            store::StoreError::Overdrawn {
                requested,
                available,
            } => Error::InsufficientCredit {
                requested,
                available,
            },
            other => Error::unavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Configuration {
            tier: Tier::Guest,
            usage_type: UsageType::ImageGeneration,
        };
        assert_eq!(
            err.to_string(),
            "No limit configured for GUEST / IMAGE_GENERATION"
        );

        let err = Error::InsufficientCredit {
            requested: 5,
            available: 3,
        };
        assert!(err.to_string().contains("requested 5"));
    }

    #[test]
    fn test_error_categories() {
        assert!(!Error::InvalidAmount.is_retryable());
        assert!(Error::InvalidAmount.is_configuration_error());
        assert!(Error::unavailable("pool timed out").is_retryable());
        assert!(
            Error::InsufficientCredit {
                requested: 1,
                available: 0
            }
            .is_retryable()
        );

        let not_found = Error::TenantNotFound {
            tenant_id: TenantId::new("t"),
        };
        assert_eq!(not_found.category(), ErrorCategory::NotFound);
        assert!(!not_found.is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: Error = store::StoreError::TenantNotFound { id: "t-9".into() }.into();
        assert!(matches!(err, Error::TenantNotFound { ref tenant_id } if tenant_id.as_str() == "t-9"));

        let err: Error = store::StoreError::Conflict {
            message: "could not serialize access".into(),
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err: Error = store::StoreError::Storage {
            message: "connection reset".into(),
        }
        .into();
        assert!(matches!(err, Error::LedgerUnavailable { .. }));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = config::ConfigError::InvalidValue {
            key: "cache.ttl_secs".into(),
            message: "invalid digit".into(),
        }
        .into();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }
}
