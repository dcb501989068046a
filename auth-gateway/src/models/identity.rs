//! Identity model - the local user record every token and link points at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Local identity.
///
/// Identities are never deleted; `active = false` is the logical delete and
/// makes every outstanding token for the identity fail authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    /// Argon2 PHC string. `None` for identities that only log in through a
    /// federated provider.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub picture: Option<String>,
    pub roles: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role every registered or federated identity starts with.
pub const DEFAULT_ROLE: &str = "user";

/// Prefix that places an identity in the policy graph. Role names may not
/// start with it, so no username can ever name a role.
pub const SUBJECT_PREFIX: &str = "user:";

/// Separates provider and subject in the usernames of federated identities.
/// Local usernames may not contain it.
pub const FEDERATED_SEPARATOR: char = ':';

impl Identity {
    /// Create a new active identity with no roles.
    pub fn new(username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
            password_hash: None,
            name: None,
            email: None,
            email_verified: false,
            picture: None,
            roles: BTreeSet::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_password_hash(mut self, hash: String) -> Self {
        self.password_hash = Some(hash);
        self
    }

    pub fn with_email(mut self, email: impl Into<String>, verified: bool) -> Self {
        self.email = Some(normalize_email(&email.into()));
        self.email_verified = verified;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// This identity's node in the policy graph, e.g. `user:tien`.
    pub fn subject(&self) -> String {
        format!("{}{}", SUBJECT_PREFIX, self.username)
    }

    /// Username given to an identity created by its first federated login.
    pub fn federated_username(provider: &str, subject_id: &str) -> String {
        format!("{}{}{}", provider, FEDERATED_SEPARATOR, subject_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Convert to sanitized response (no credential material).
    pub fn sanitized(&self) -> IdentityResponse {
        IdentityResponse::from(self.clone())
    }
}

/// Emails are compared case-insensitively.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Identity as returned over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub id: Uuid,
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub email_verified: bool,
    pub picture: Option<String>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Identity> for IdentityResponse {
    fn from(i: Identity) -> Self {
        Self {
            id: i.id,
            username: i.username,
            name: i.name,
            email: i.email,
            email_verified: i.email_verified,
            picture: i.picture,
            roles: i.roles.into_iter().collect(),
            created_at: i.created_at,
        }
    }
}
