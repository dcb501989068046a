use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Pending OAuth login, keyed by the opaque `state` sent to the provider.
///
/// Single use: the store hands it out at most once through `consume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeState {
    pub state: String,
    pub provider: String,
    pub return_to: Option<String>,
    /// PKCE verifier, never sent to the browser.
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HandshakeState {
    pub fn new(
        state: String,
        provider: impl Into<String>,
        return_to: Option<String>,
        code_verifier: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            state,
            provider: provider.into(),
            return_to,
            code_verifier,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Seconds until expiry, floored at 1 so backends with TTLs accept it.
    pub fn ttl_seconds(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(1)
    }
}
