//! Storage seams for identities, policies, revocations, token families and
//! OAuth handshakes.
//!
//! Every store is a trait object so the services never know which backend is
//! behind them. The in-memory backends are used by tests and single-node
//! deployments; Redis backs the short-lived token state and Postgres the
//! durable identity and policy tables.

mod memory;
mod postgres;
mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::models::{ExternalLink, GroupingRule, HandshakeState, Identity, PolicyRule, TokenFamily};

pub use self::memory::{
    MemoryFamilyLedger, MemoryHandshakeStore, MemoryIdentityStore, MemoryPolicyRepository,
    MemoryRevocationRegistry,
};
pub use self::postgres::{create_pool, run_migrations, PgIdentityStore, PgPolicyRepository};
pub use self::redis::RedisStore;

/// Every store the gateway needs, as trait objects.
#[derive(Clone)]
pub struct Stores {
    pub identities: Arc<dyn IdentityStore>,
    pub policies: Arc<dyn PolicyRepository>,
    pub revocations: Arc<dyn RevocationRegistry>,
    pub families: Arc<dyn FamilyLedger>,
    pub handshakes: Arc<dyn HandshakeStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            identities: Arc::new(MemoryIdentityStore::new()),
            policies: Arc::new(MemoryPolicyRepository::new()),
            revocations: Arc::new(MemoryRevocationRegistry::new()),
            families: Arc::new(MemoryFamilyLedger::new()),
            handshakes: Arc::new(MemoryHandshakeStore::new()),
        }
    }

    /// Open the configured backends. Postgres migrations run here.
    pub async fn connect(config: &StorageConfig, key_prefix: &str) -> Result<Self, anyhow::Error> {
        let mut stores = Self::in_memory();

        if config.backend == StorageBackend::Postgres {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
            let pool = create_pool(url, config.database_max_connections).await?;
            run_migrations(&pool).await?;
            tracing::info!("PostgreSQL identity and policy stores ready");

            stores.identities = Arc::new(PgIdentityStore::new(pool.clone()));
            stores.policies = Arc::new(PgPolicyRepository::new(pool));
        }

        match &config.redis_url {
            Some(url) => {
                let redis = Arc::new(RedisStore::new(url, key_prefix).await?);
                tracing::info!("Redis revocation registry, family ledger and handshake store ready");
                stores.revocations = redis.clone();
                stores.families = redis.clone();
                stores.handshakes = redis;
            }
            None => {
                tracing::warn!("REDIS_URL not set, token and handshake state is process-local");
            }
        }

        Ok(stores)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule would be broken by the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Backend(anyhow::anyhow!("redis: {}", err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(anyhow::anyhow!("postgres: {}", err))
    }
}

/// Where a first-time external login should land.
#[derive(Debug, Clone)]
pub enum LinkTarget {
    /// Attach the external subject to an identity that already exists.
    Existing(Uuid),
    /// Create this identity together with the link.
    New(Identity),
}

/// Result of [`IdentityStore::link_identity`].
#[derive(Debug, Clone)]
pub enum LinkOutcome {
    /// The `(provider, subject)` pair was already linked, possibly by a
    /// concurrent callback; nothing was written.
    Existing(Identity),
    /// A link to an existing identity was created.
    Linked(Identity),
    /// A new identity and its link were created.
    Created(Identity),
}

impl LinkOutcome {
    pub fn identity(&self) -> &Identity {
        match self {
            LinkOutcome::Existing(i) | LinkOutcome::Linked(i) | LinkOutcome::Created(i) => i,
        }
    }

    pub fn into_identity(self) -> Identity {
        match self {
            LinkOutcome::Existing(i) | LinkOutcome::Linked(i) | LinkOutcome::Created(i) => i,
        }
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] when the username is taken.
    async fn insert(&self, identity: &Identity) -> Result<(), StoreError>;
    async fn update(&self, identity: &Identity) -> Result<(), StoreError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError>;
    /// All identities holding `email` (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError>;
    async fn find_link(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<ExternalLink>, StoreError>;
    async fn links_for(&self, identity_id: Uuid) -> Result<Vec<ExternalLink>, StoreError>;

    /// Atomically create the `(provider, subject)` link, and the identity when
    /// `target` is [`LinkTarget::New`]. Either everything is written or
    /// nothing is.
    ///
    /// Fails with [`StoreError::Conflict`] when the target identity already
    /// holds a link for `provider`, or when a new identity's username is taken.
    async fn link_identity(
        &self,
        provider: &str,
        subject: &str,
        target: LinkTarget,
    ) -> Result<LinkOutcome, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Durable policy and grouping tuples. Writes report whether anything changed.
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn load(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>), StoreError>;
    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError>;
    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError>;
    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError>;
    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError>;
}

/// Revoked token and family ids. Entries expire with the tokens they
/// cover so the registry does not grow without bound.
#[async_trait]
pub trait RevocationRegistry: Send + Sync {
    async fn revoke_token(&self, jti: Uuid, ttl_seconds: i64) -> Result<(), StoreError>;
    async fn revoke_family(&self, family_id: Uuid, ttl_seconds: i64) -> Result<(), StoreError>;
    async fn is_token_revoked(&self, jti: Uuid) -> Result<bool, StoreError>;
    async fn is_family_revoked(&self, family_id: Uuid) -> Result<bool, StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Outcome of a compare-and-swap on a family's current refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The presented jti was current and has been replaced.
    Advanced,
    /// The presented jti was already rotated away.
    Reused,
    Revoked,
    Unknown,
}

#[async_trait]
pub trait FamilyLedger: Send + Sync {
    async fn open(&self, family: &TokenFamily) -> Result<(), StoreError>;

    /// Replace `presented` with `next` iff `presented` is the family's current
    /// refresh jti, and keep the family until `expires_at`, the expiry of
    /// `next`. Check and write happen as one atomic step.
    async fn advance(
        &self,
        family_id: Uuid,
        presented: Uuid,
        next: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Advance, StoreError>;

    async fn revoke(&self, family_id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HandshakeStore: Send + Sync {
    async fn put(&self, handshake: &HandshakeState) -> Result<(), StoreError>;

    /// Remove and return the handshake. Of any number of concurrent callers
    /// presenting the same state, at most one receives `Some`.
    async fn consume(&self, state: &str) -> Result<Option<HandshakeState>, StoreError>;
}
