use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lineage of token pairs produced from one issuance by successive rotation.
///
/// `current_refresh_jti` is the only refresh token of the family that may be
/// rotated; presenting any other jti of the family is reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFamily {
    pub family_id: Uuid,
    pub subject: Uuid,
    pub current_refresh_jti: Uuid,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl TokenFamily {
    pub fn new(subject: Uuid, first_refresh_jti: Uuid, expires_at: DateTime<Utc>) -> Self {
        Self {
            family_id: Uuid::new_v4(),
            subject,
            current_refresh_jti: first_refresh_jti,
            created_at: Utc::now(),
            rotated_at: None,
            expires_at,
            revoked: false,
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(1)
    }
}
