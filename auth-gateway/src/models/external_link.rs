use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `(provider, subject)` → identity. Unique on the pair, and an identity holds
/// at most one link per provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub provider: String,
    pub subject: String,
    pub identity_id: Uuid,
    pub linked_at: DateTime<Utc>,
}

impl ExternalLink {
    pub fn new(provider: impl Into<String>, subject: impl Into<String>, identity_id: Uuid) -> Self {
        Self {
            provider: provider.into(),
            subject: subject.into(),
            identity_id,
            linked_at: Utc::now(),
        }
    }
}
