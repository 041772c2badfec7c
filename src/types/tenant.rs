use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable tenant identifier supplied by the identity resolver.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Account tier, selecting the row of the limit table.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Guest,
    Standard,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Guest, Tier::Standard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Guest => "GUEST",
            Tier::Standard => "STANDARD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account against which usage and credit are tracked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>, tier: Tier, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            tier,
            created_at,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.tier == Tier::Guest
    }
}
