//! Per-tier quota table.
//!
//! Limits can be customized via environment variables, a JSON document, or
//! programmatically. Defaults follow the product's published guest and
//! standard allowances.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::types::{Tier, UsageType};
use crate::{Error, Result};

const ENV_LIMIT_PREFIX: &str = "LEDGER_LIMIT_";
const ENV_RETENTION_PREFIX: &str = "LEDGER_RETENTION_";

/// JSON shape accepted by [`LimitTableBuilder::document`]:
/// `{ "GUEST": { "AUDIO_GENERATION": 10 }, ... }`.
pub type LimitsDocument = HashMap<Tier, HashMap<UsageType, u64>>;

#[derive(Debug, Clone, PartialEq)]
pub struct LimitTable {
    limits: HashMap<(Tier, UsageType), u64>,
    retention_days: HashMap<Tier, u32>,
}

impl LimitTable {
    pub fn builder() -> LimitTableBuilder {
        LimitTableBuilder::new()
    }

    /// Period ceiling for `usage_type` at `tier`.
    ///
    /// A missing cell is a deployment bug and is never retried.
    pub fn limit(&self, tier: Tier, usage_type: UsageType) -> Result<u64> {
        self.limits
            .get(&(tier, usage_type))
            .copied()
            .ok_or(Error::Configuration { tier, usage_type })
    }

    /// How long usage history is kept for `tier`. `None` keeps it forever.
    pub fn retention(&self, tier: Tier) -> Option<chrono::Duration> {
        self.retention_days
            .get(&tier)
            .map(|days| chrono::Duration::days(i64::from(*days)))
    }

    pub fn tiers(&self) -> Vec<Tier> {
        let mut tiers: Vec<Tier> = self.limits.keys().map(|(tier, _)| *tier).collect();
        tiers.sort();
        tiers.dedup();
        tiers
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        default_limit_table().clone()
    }
}

#[derive(Debug, Default)]
pub struct LimitTableBuilder {
    limits: HashMap<(Tier, UsageType), u64>,
    retention_days: HashMap<Tier, u32>,
}

impl LimitTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self) -> Self {
        use UsageType::*;

        for (usage_type, guest, standard) in [
            (ContextTokens, 4000, 16000),
            (AudioGeneration, 10, 50),
            (DocumentProcessing, 20, 100),
            (ImageGeneration, 5, 25),
        ] {
            self.limits.insert((Tier::Guest, usage_type), guest);
            self.limits.insert((Tier::Standard, usage_type), standard);
        }
        self.retention_days.insert(Tier::Guest, 7);
        self.retention_days.insert(Tier::Standard, 30);
        self
    }

    pub fn limit(mut self, tier: Tier, usage_type: UsageType, limit: u64) -> Self {
        self.limits.insert((tier, usage_type), limit);
        self
    }

    pub fn retention_days(mut self, tier: Tier, days: u32) -> Self {
        self.retention_days.insert(tier, days);
        self
    }

    /// Overlay every cell present in `document`.
    pub fn document(mut self, document: &LimitsDocument) -> Self {
        for (tier, row) in document {
            for (usage_type, limit) in row {
                self.limits.insert((*tier, *usage_type), *limit);
            }
        }
        self
    }

    /// Defaults overlaid with `LEDGER_LIMIT_<TIER>_<USAGE_TYPE>` and
    /// `LEDGER_RETENTION_<TIER>_DAYS` variables.
    pub fn from_env(self) -> Self {
        self.with_defaults().env_overrides()
    }

    /// Overlay only the cells set through environment variables.
    pub fn env_overrides(mut self) -> Self {
        for tier in Tier::ALL {
            for usage_type in UsageType::ALL {
                if let Some(limit) = Self::parse_env_limit(tier, usage_type) {
                    self.limits.insert((tier, usage_type), limit);
                }
            }
            if let Some(days) = Self::parse_env_retention(tier) {
                self.retention_days.insert(tier, days);
            }
        }

        self
    }

    fn parse_env_limit(tier: Tier, usage_type: UsageType) -> Option<u64> {
        let name = format!("{}{}_{}", ENV_LIMIT_PREFIX, tier.as_str(), usage_type.as_str());
        let raw = std::env::var(&name).ok()?;
        match raw.trim().parse::<u64>() {
            Ok(limit) => Some(limit),
            Err(e) => {
                tracing::warn!(variable = %name, error = %e, "Ignoring unparsable limit override");
                None
            }
        }
    }

    fn parse_env_retention(tier: Tier) -> Option<u32> {
        std::env::var(format!("{}{}_DAYS", ENV_RETENTION_PREFIX, tier.as_str()))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn build(self) -> LimitTable {
        LimitTable {
            limits: self.limits,
            retention_days: self.retention_days,
        }
    }
}

static DEFAULT_LIMITS: LazyLock<LimitTable> =
    LazyLock::new(|| LimitTableBuilder::new().from_env().build());

pub fn default_limit_table() -> &'static LimitTable {
    &DEFAULT_LIMITS
}
