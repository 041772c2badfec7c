use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TenantId;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantId(pub Uuid);

impl GrantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GrantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GrantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Origin of a credit grant. The declaration order is the tie-break order
/// used when two grants expire at the same instant.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantType {
    Trial,
    Purchased,
    Promotional,
}

impl GrantType {
    pub const ALL: [GrantType; 3] = [
        GrantType::Trial,
        GrantType::Purchased,
        GrantType::Promotional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::Trial => "TRIAL",
            GrantType::Purchased => "PURCHASED",
            GrantType::Promotional => "PROMOTIONAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded, possibly expiring allotment of spendable credit.
///
/// A grant whose `remaining` is zero or whose expiry has passed is inert but
/// kept for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: GrantId,
    pub tenant_id: TenantId,
    pub remaining: u64,
    pub grant_type: GrantType,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CreditGrant {
    pub fn new(
        tenant_id: TenantId,
        amount: u64,
        grant_type: GrantType,
        expires_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: GrantId::new(),
            tenant_id,
            remaining: amount,
            grant_type,
            expires_at,
            created_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the grant can still contribute to a debit at `now`.
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 && !self.is_expired(now)
    }
}
