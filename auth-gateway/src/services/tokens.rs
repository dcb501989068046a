//! Token lifecycle: issue, verify, rotate, revoke.
//!
//! Every issuance opens a token family in the [`FamilyLedger`]. The ledger
//! holds the single refresh jti of the family that may still be rotated;
//! rotation swaps it with a compare-and-swap, so of two concurrent rotations
//! of the same refresh token exactly one wins and the other is treated as
//! reuse. Liveness is decided by the [`RevocationRegistry`], never by the
//! signature alone.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::jwt::{Claims, JwtService, TokenKind};
use super::GatewayError;
use crate::models::{Identity, TokenFamily};
use crate::store::{Advance, FamilyLedger, IdentityStore, RevocationRegistry};

/// Token response returned to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// A live access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject: Uuid,
    pub family_id: Uuid,
    pub jti: Uuid,
    pub expires_at: i64,
}

impl From<Claims> for VerifiedToken {
    fn from(c: Claims) -> Self {
        Self {
            subject: c.sub,
            family_id: c.fam,
            jti: c.jti,
            expires_at: c.exp,
        }
    }
}

#[derive(Clone)]
pub struct TokenLifecycleManager {
    jwt: JwtService,
    identities: Arc<dyn IdentityStore>,
    registry: Arc<dyn RevocationRegistry>,
    ledger: Arc<dyn FamilyLedger>,
}

impl TokenLifecycleManager {
    pub fn new(
        jwt: JwtService,
        identities: Arc<dyn IdentityStore>,
        registry: Arc<dyn RevocationRegistry>,
        ledger: Arc<dyn FamilyLedger>,
    ) -> Self {
        Self {
            jwt,
            identities,
            registry,
            ledger,
        }
    }

    pub fn registry(&self) -> &Arc<dyn RevocationRegistry> {
        &self.registry
    }

    /// Mint a fresh family and its first pair.
    pub async fn issue(&self, identity: &Identity) -> Result<TokenPair, GatewayError> {
        if !identity.active {
            return Err(GatewayError::InvalidCredentials);
        }

        let mut family = TokenFamily::new(identity.id, Uuid::new_v4(), Utc::now());
        let refresh =
            self.jwt
                .refresh_claims(identity.id, family.family_id, family.current_refresh_jti);
        family.expires_at = expiry_of(&refresh)?;
        self.ledger.open(&family).await?;

        let pair = self.mint_pair(refresh)?;
        tracing::info!(subject = %identity.id, family = %family.family_id, "Token family issued");
        Ok(pair)
    }

    /// Fails with `TokenExpired`, `TokenInvalid` or `TokenRevoked`.
    pub async fn verify(&self, access_token: &str) -> Result<VerifiedToken, GatewayError> {
        let claims = self.jwt.decode(access_token, TokenKind::Access)?;

        if self.registry.is_token_revoked(claims.jti).await?
            || self.registry.is_family_revoked(claims.fam).await?
        {
            return Err(GatewayError::TokenRevoked);
        }

        Ok(claims.into())
    }

    /// Exchange a refresh token for a new pair in the same family.
    ///
    /// Presenting a refresh token that was already rotated away revokes the
    /// whole family and fails with `TokenReused`.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, GatewayError> {
        let claims = self.jwt.decode(refresh_token, TokenKind::Refresh)?;

        if self.registry.is_family_revoked(claims.fam).await? {
            return Err(GatewayError::TokenRevoked);
        }

        let identity = self.identities.find_by_id(claims.sub).await?;
        if !identity.is_some_and(|i| i.active) {
            self.revoke_family(claims.fam).await?;
            tracing::warn!(subject = %claims.sub, family = %claims.fam, "Refresh for inactive identity, family revoked");
            return Err(GatewayError::TokenRevoked);
        }

        let next = self.jwt.refresh_claims(claims.sub, claims.fam, Uuid::new_v4());
        let outcome = self
            .ledger
            .advance(claims.fam, claims.jti, next.jti, expiry_of(&next)?)
            .await?;
        match outcome {
            Advance::Advanced => {
                self.registry
                    .revoke_token(claims.jti, remaining_seconds(claims.exp))
                    .await?;
                let pair = self.mint_pair(next)?;
                tracing::info!(subject = %claims.sub, family = %claims.fam, "Token family rotated");
                Ok(pair)
            }
            Advance::Reused => {
                self.revoke_family(claims.fam).await?;
                tracing::warn!(
                    subject = %claims.sub,
                    family = %claims.fam,
                    "Refresh token reuse detected, family revoked"
                );
                Err(GatewayError::TokenReused)
            }
            Advance::Revoked => Err(GatewayError::TokenRevoked),
            Advance::Unknown => Err(GatewayError::TokenInvalid),
        }
    }

    /// Revoke the family of an access or refresh token. Returns the family id.
    pub async fn revoke(&self, token: &str) -> Result<Uuid, GatewayError> {
        let claims = self.decode_either(token)?;
        self.revoke_claims(claims).await
    }

    /// Like [`revoke`](Self::revoke), for a token that must belong to `subject`.
    pub async fn revoke_owned(&self, token: &str, subject: Uuid) -> Result<Uuid, GatewayError> {
        let claims = self.decode_either(token)?;
        if claims.sub != subject {
            tracing::warn!(subject = %subject, "Refusing to revoke a token of another subject");
            return Err(GatewayError::TokenInvalid);
        }
        self.revoke_claims(claims).await
    }

    fn decode_either(&self, token: &str) -> Result<Claims, GatewayError> {
        match self.jwt.decode(token, TokenKind::Access) {
            Err(GatewayError::TokenInvalid) => self.jwt.decode(token, TokenKind::Refresh),
            other => other,
        }
    }

    async fn revoke_claims(&self, claims: Claims) -> Result<Uuid, GatewayError> {
        self.registry
            .revoke_token(claims.jti, remaining_seconds(claims.exp))
            .await?;
        self.revoke_family(claims.fam).await?;
        tracing::info!(subject = %claims.sub, family = %claims.fam, "Token family revoked");
        Ok(claims.fam)
    }

    /// Every token of the family fails from now on, for as long as any of
    /// them could still be unexpired.
    pub async fn revoke_family(&self, family_id: Uuid) -> Result<(), GatewayError> {
        self.registry
            .revoke_family(family_id, self.jwt.refresh_token_expiry_seconds())
            .await?;
        self.ledger.revoke(family_id).await?;
        Ok(())
    }

    fn mint_pair(&self, refresh: Claims) -> Result<TokenPair, GatewayError> {
        let access = self.jwt.access_claims(refresh.sub, refresh.fam);

        Ok(TokenPair {
            access_token: self.jwt.encode(&access)?,
            refresh_token: self.jwt.encode(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }
}

/// The family must outlive its newest refresh token.
fn expiry_of(refresh: &Claims) -> Result<DateTime<Utc>, GatewayError> {
    Utc.timestamp_opt(refresh.exp, 0).single().ok_or_else(|| {
        GatewayError::Internal(anyhow::anyhow!("refresh expiry {} out of range", refresh.exp))
    })
}

fn remaining_seconds(exp: i64) -> i64 {
    (exp - Utc::now().timestamp()).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JwtConfig, SigningKey};
    use crate::store::{MemoryFamilyLedger, MemoryIdentityStore, MemoryRevocationRegistry};

    struct Fixture {
        tokens: TokenLifecycleManager,
        identities: Arc<MemoryIdentityStore>,
        identity: Identity,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryFamilyLedger::new())).await
    }

    async fn fixture_with(ledger: Arc<dyn FamilyLedger>) -> Fixture {
        let jwt = JwtService::new(&JwtConfig {
            signing_key: SigningKey::Secret("test-signing-secret-with-at-least-32-bytes".into()),
            issuer: "auth-gateway".into(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        })
        .unwrap();
        let identities = Arc::new(MemoryIdentityStore::new());
        let identity = Identity::new("tien");
        identities.insert(&identity).await.unwrap();

        Fixture {
            tokens: TokenLifecycleManager::new(
                jwt,
                identities.clone(),
                Arc::new(MemoryRevocationRegistry::new()),
                ledger,
            ),
            identities,
            identity,
        }
    }

    #[tokio::test]
    async fn verify_returns_the_issued_subject() {
        let f = fixture().await;
        let pair = f.tokens.issue(&f.identity).await.unwrap();

        let verified = f.tokens.verify(&pair.access_token).await.unwrap();
        assert_eq!(verified.subject, f.identity.id);
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 15 * 60);
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let f = fixture().await;
        let pair = f.tokens.issue(&f.identity).await.unwrap();

        assert!(matches!(
            f.tokens.verify(&pair.refresh_token).await,
            Err(GatewayError::TokenInvalid)
        ));
    }

    #[tokio::test]
    async fn revoked_access_token_fails_verification() {
        let f = fixture().await;
        let pair = f.tokens.issue(&f.identity).await.unwrap();

        f.tokens.revoke(&pair.access_token).await.unwrap();
        assert!(matches!(
            f.tokens.verify(&pair.access_token).await,
            Err(GatewayError::TokenRevoked)
        ));
        assert!(matches!(
            f.tokens.rotate(&pair.refresh_token).await,
            Err(GatewayError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn reuse_revokes_the_whole_family() {
        let f = fixture().await;
        let original = f.tokens.issue(&f.identity).await.unwrap();

        let rotated = f.tokens.rotate(&original.refresh_token).await.unwrap();
        assert!(f.tokens.verify(&rotated.access_token).await.is_ok());

        assert!(matches!(
            f.tokens.rotate(&original.refresh_token).await,
            Err(GatewayError::TokenReused)
        ));
        assert!(matches!(
            f.tokens.verify(&rotated.access_token).await,
            Err(GatewayError::TokenRevoked)
        ));
        assert!(matches!(
            f.tokens.rotate(&rotated.refresh_token).await,
            Err(GatewayError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn rotation_chain_keeps_the_family() {
        let f = fixture().await;
        let first = f.tokens.issue(&f.identity).await.unwrap();
        let second = f.tokens.rotate(&first.refresh_token).await.unwrap();
        let third = f.tokens.rotate(&second.refresh_token).await.unwrap();

        let a = f.tokens.verify(&first.access_token).await.unwrap();
        let c = f.tokens.verify(&third.access_token).await.unwrap();
        assert_eq!(a.family_id, c.family_id);
    }

    /// Remembers the expiry each family was opened or advanced with.
    #[derive(Default)]
    struct RecordingLedger {
        inner: MemoryFamilyLedger,
        expiries: parking_lot::Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait::async_trait]
    impl FamilyLedger for RecordingLedger {
        async fn open(&self, family: &TokenFamily) -> Result<(), crate::store::StoreError> {
            self.expiries.lock().push(family.expires_at);
            self.inner.open(family).await
        }

        async fn advance(
            &self,
            family_id: Uuid,
            presented: Uuid,
            next: Uuid,
            expires_at: DateTime<Utc>,
        ) -> Result<Advance, crate::store::StoreError> {
            self.expiries.lock().push(expires_at);
            self.inner.advance(family_id, presented, next, expires_at).await
        }

        async fn revoke(&self, family_id: Uuid) -> Result<(), crate::store::StoreError> {
            self.inner.revoke(family_id).await
        }
    }

    #[tokio::test]
    async fn family_lives_as_long_as_its_newest_refresh_token() {
        let ledger = Arc::new(RecordingLedger::default());
        let f = fixture_with(ledger.clone()).await;
        let first = f.tokens.issue(&f.identity).await.unwrap();
        let second = f.tokens.rotate(&first.refresh_token).await.unwrap();

        let exp = |token: &str| f.tokens.jwt.decode(token, TokenKind::Refresh).unwrap().exp;
        let expiries: Vec<i64> = ledger.expiries.lock().iter().map(|e| e.timestamp()).collect();
        assert_eq!(expiries, vec![exp(&first.refresh_token), exp(&second.refresh_token)]);
    }

    #[tokio::test]
    async fn concurrent_rotation_has_one_winner() {
        let f = fixture().await;
        let pair = f.tokens.issue(&f.identity).await.unwrap();

        let (a, b) = tokio::join!(
            f.tokens.rotate(&pair.refresh_token),
            f.tokens.rotate(&pair.refresh_token)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn inactive_identities_get_no_tokens() {
        let f = fixture().await;
        let pair = f.tokens.issue(&f.identity).await.unwrap();

        let mut inactive = f.identity.clone();
        inactive.active = false;
        f.identities.update(&inactive).await.unwrap();

        assert!(matches!(
            f.tokens.issue(&inactive).await,
            Err(GatewayError::InvalidCredentials)
        ));
        assert!(matches!(
            f.tokens.rotate(&pair.refresh_token).await,
            Err(GatewayError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn revoke_owned_refuses_foreign_tokens() {
        let f = fixture().await;
        let other = Identity::new("blackpresident");
        f.identities.insert(&other).await.unwrap();
        let theirs = f.tokens.issue(&other).await.unwrap();

        assert!(matches!(
            f.tokens.revoke_owned(&theirs.refresh_token, f.identity.id).await,
            Err(GatewayError::TokenInvalid)
        ));
        assert!(f.tokens.verify(&theirs.access_token).await.is_ok());

        f.tokens
            .revoke_owned(&theirs.refresh_token, other.id)
            .await
            .unwrap();
        assert!(matches!(
            f.tokens.verify(&theirs.access_token).await,
            Err(GatewayError::TokenRevoked)
        ));
    }

    #[tokio::test]
    async fn garbage_refresh_token_is_invalid() {
        let f = fixture().await;
        assert!(matches!(
            f.tokens.rotate("garbage").await,
            Err(GatewayError::TokenInvalid)
        ));
    }
}
