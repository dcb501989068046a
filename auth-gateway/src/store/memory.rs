//! In-process backends.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use super::{
    Advance, FamilyLedger, HandshakeStore, IdentityStore, LinkOutcome, LinkTarget,
    PolicyRepository, RevocationRegistry, StoreError,
};
use crate::models::identity::normalize_email;
use crate::models::{ExternalLink, GroupingRule, HandshakeState, Identity, PolicyRule, TokenFamily};

#[derive(Default)]
struct IdentityTables {
    identities: HashMap<Uuid, Identity>,
    usernames: HashMap<String, Uuid>,
    links: HashMap<(String, String), ExternalLink>,
}

impl IdentityTables {
    fn insert_identity(&mut self, identity: &Identity) -> Result<(), StoreError> {
        if self.usernames.contains_key(&identity.username) {
            return Err(StoreError::Conflict(format!(
                "username '{}' is taken",
                identity.username
            )));
        }
        self.usernames.insert(identity.username.clone(), identity.id);
        self.identities.insert(identity.id, identity.clone());
        Ok(())
    }

    fn has_link_for(&self, identity_id: Uuid, provider: &str) -> bool {
        self.links
            .values()
            .any(|l| l.identity_id == identity_id && l.provider == provider)
    }
}

/// Identity and link tables behind one lock, so a link-or-create is a single
/// critical section.
#[derive(Default)]
pub struct MemoryIdentityStore {
    tables: RwLock<IdentityTables>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        self.tables.write().insert_identity(identity)
    }

    async fn update(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        match tables.identities.get_mut(&identity.id) {
            Some(existing) => {
                *existing = identity.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(anyhow::anyhow!(
                "identity {} does not exist",
                identity.id
            ))),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        Ok(self.tables.read().identities.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .usernames
            .get(username)
            .and_then(|id| tables.identities.get(id))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError> {
        let email = normalize_email(email);
        let tables = self.tables.read();
        let mut found: Vec<Identity> = tables
            .identities
            .values()
            .filter(|i| i.email.as_deref() == Some(email.as_str()))
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }

    async fn find_link(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<ExternalLink>, StoreError> {
        Ok(self
            .tables
            .read()
            .links
            .get(&(provider.to_string(), subject.to_string()))
            .cloned())
    }

    async fn links_for(&self, identity_id: Uuid) -> Result<Vec<ExternalLink>, StoreError> {
        let tables = self.tables.read();
        let mut links: Vec<ExternalLink> = tables
            .links
            .values()
            .filter(|l| l.identity_id == identity_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(links)
    }

    async fn link_identity(
        &self,
        provider: &str,
        subject: &str,
        target: LinkTarget,
    ) -> Result<LinkOutcome, StoreError> {
        let mut tables = self.tables.write();
        let key = (provider.to_string(), subject.to_string());

        if let Some(link) = tables.links.get(&key) {
            let identity = tables.identities.get(&link.identity_id).cloned().ok_or_else(|| {
                StoreError::Backend(anyhow::anyhow!("link points at a missing identity"))
            })?;
            return Ok(LinkOutcome::Existing(identity));
        }

        let outcome = match target {
            LinkTarget::Existing(id) => {
                let identity = tables.identities.get(&id).cloned().ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!("identity {} does not exist", id))
                })?;
                if tables.has_link_for(id, provider) {
                    return Err(StoreError::Conflict(format!(
                        "identity is already linked to another {} account",
                        provider
                    )));
                }
                LinkOutcome::Linked(identity)
            }
            LinkTarget::New(identity) => {
                tables.insert_identity(&identity)?;
                LinkOutcome::Created(identity)
            }
        };

        let link = ExternalLink::new(provider, subject, outcome.identity().id);
        tables.links.insert(key, link);
        Ok(outcome)
    }
}

#[derive(Default)]
pub struct MemoryPolicyRepository {
    rules: Mutex<(BTreeSet<PolicyRule>, BTreeSet<GroupingRule>)>,
}

impl MemoryPolicyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyRepository for MemoryPolicyRepository {
    async fn load(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>), StoreError> {
        let rules = self.rules.lock();
        Ok((
            rules.0.iter().cloned().collect(),
            rules.1.iter().cloned().collect(),
        ))
    }

    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError> {
        Ok(self.rules.lock().0.insert(rule.clone()))
    }

    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError> {
        Ok(self.rules.lock().0.remove(rule))
    }

    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError> {
        Ok(self.rules.lock().1.insert(rule.clone()))
    }

    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError> {
        Ok(self.rules.lock().1.remove(rule))
    }
}

/// Revoked id → when the revocation lapses. Expired entries are dropped on
/// every write, and on lookup.
#[derive(Default)]
pub struct MemoryRevocationRegistry {
    tokens: DashMap<Uuid, DateTime<Utc>>,
    families: DashMap<Uuid, DateTime<Utc>>,
}

impl MemoryRevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(map: &DashMap<Uuid, DateTime<Utc>>, id: Uuid, ttl_seconds: i64) {
        let now = Utc::now();
        map.retain(|_, expires_at| *expires_at > now);
        map.insert(id, now + Duration::seconds(ttl_seconds.max(1)));
    }

    fn live(map: &DashMap<Uuid, DateTime<Utc>>, id: Uuid) -> bool {
        let now = Utc::now();
        // remove_if takes the shard lock, so the check and the purge are one step
        if map.remove_if(&id, |_, expires_at| *expires_at <= now).is_some() {
            return false;
        }
        map.contains_key(&id)
    }
}

#[async_trait]
impl RevocationRegistry for MemoryRevocationRegistry {
    async fn revoke_token(&self, jti: Uuid, ttl_seconds: i64) -> Result<(), StoreError> {
        Self::record(&self.tokens, jti, ttl_seconds);
        Ok(())
    }

    async fn revoke_family(&self, family_id: Uuid, ttl_seconds: i64) -> Result<(), StoreError> {
        Self::record(&self.families, family_id, ttl_seconds);
        Ok(())
    }

    async fn is_token_revoked(&self, jti: Uuid) -> Result<bool, StoreError> {
        Ok(Self::live(&self.tokens, jti))
    }

    async fn is_family_revoked(&self, family_id: Uuid) -> Result<bool, StoreError> {
        Ok(Self::live(&self.families, family_id))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Families are dropped once their newest refresh token has expired; no token
/// of theirs can be presented after that.
#[derive(Default)]
pub struct MemoryFamilyLedger {
    families: DashMap<Uuid, TokenFamily>,
}

impl MemoryFamilyLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FamilyLedger for MemoryFamilyLedger {
    async fn open(&self, family: &TokenFamily) -> Result<(), StoreError> {
        let now = Utc::now();
        self.families.retain(|_, f| f.expires_at > now);
        self.families.insert(family.family_id, family.clone());
        Ok(())
    }

    async fn advance(
        &self,
        family_id: Uuid,
        presented: Uuid,
        next: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Advance, StoreError> {
        // get_mut holds the shard write lock for the whole compare-and-swap
        let Some(mut family) = self.families.get_mut(&family_id) else {
            return Ok(Advance::Unknown);
        };
        if family.revoked {
            return Ok(Advance::Revoked);
        }
        if family.current_refresh_jti != presented {
            return Ok(Advance::Reused);
        }
        family.current_refresh_jti = next;
        family.rotated_at = Some(Utc::now());
        family.expires_at = expires_at;
        Ok(Advance::Advanced)
    }

    async fn revoke(&self, family_id: Uuid) -> Result<(), StoreError> {
        if let Some(mut family) = self.families.get_mut(&family_id) {
            family.revoked = true;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHandshakeStore {
    pending: DashMap<String, HandshakeState>,
}

impl MemoryHandshakeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandshakeStore for MemoryHandshakeStore {
    async fn put(&self, handshake: &HandshakeState) -> Result<(), StoreError> {
        self.pending.retain(|_, h| !h.is_expired());
        self.pending
            .insert(handshake.state.clone(), handshake.clone());
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<Option<HandshakeState>, StoreError> {
        Ok(self.pending.remove(state).map(|(_, h)| h))
    }
}
