use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TenantId;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UsageEventId(pub Uuid);

impl UsageEventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UsageEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UsageEventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of metered consumption.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    ContextTokens,
    AudioGeneration,
    DocumentProcessing,
    ImageGeneration,
}

impl UsageType {
    pub const ALL: [UsageType; 4] = [
        UsageType::ContextTokens,
        UsageType::AudioGeneration,
        UsageType::DocumentProcessing,
        UsageType::ImageGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::ContextTokens => "CONTEXT_TOKENS",
            UsageType::AudioGeneration => "AUDIO_GENERATION",
            UsageType::DocumentProcessing => "DOCUMENT_PROCESSING",
            UsageType::ImageGeneration => "IMAGE_GENERATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one admitted consumption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: UsageEventId,
    pub tenant_id: TenantId,
    pub usage_type: UsageType,
    pub amount: u64,
    pub notebook_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        tenant_id: TenantId,
        usage_type: UsageType,
        amount: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UsageEventId::new(),
            tenant_id,
            usage_type,
            amount,
            notebook_id: None,
            created_at,
        }
    }

    pub fn with_notebook(mut self, notebook_id: Option<String>) -> Self {
        self.notebook_id = notebook_id;
        self
    }
}
