//! Identity federation: `Start` → awaiting callback → resolved or failed.
//!
//! The handshake is consumed before anything else happens on the callback,
//! so a state value resolves at most once whatever the outcome.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::RngCore;
use service_core::retry::{retry_with_backoff, RetryConfig, Transient};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::providers::{AuthorizationGrant, IdentityProvider, ProviderError, ProviderProfile};
use super::tokens::{TokenLifecycleManager, TokenPair};
use super::GatewayError;
use crate::models::{HandshakeState, Identity, DEFAULT_ROLE};
use crate::store::{HandshakeStore, IdentityStore, LinkOutcome, LinkTarget, StoreError};

#[derive(Debug, Clone)]
pub struct FederationSettings {
    pub handshake_ttl: chrono::Duration,
    pub exchange_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: String,
    pub state: String,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters the provider sends back to the callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FederationOutcome {
    pub identity: Identity,
    pub tokens: TokenPair,
    /// Whether the identity was created by this login.
    pub created: bool,
    pub return_to: Option<String>,
}

#[derive(Clone)]
pub struct FederationFlow {
    providers: Arc<HashMap<String, Arc<dyn IdentityProvider>>>,
    handshakes: Arc<dyn HandshakeStore>,
    identities: Arc<dyn IdentityStore>,
    tokens: TokenLifecycleManager,
    settings: FederationSettings,
}

impl FederationFlow {
    pub fn new(
        providers: Vec<Arc<dyn IdentityProvider>>,
        handshakes: Arc<dyn HandshakeStore>,
        identities: Arc<dyn IdentityStore>,
        tokens: TokenLifecycleManager,
        settings: FederationSettings,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            providers: Arc::new(providers),
            handshakes,
            identities,
            tokens,
            settings,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn IdentityProvider>, GatewayError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("Provider '{}'", name)))
    }

    /// Persist a fresh handshake and return the provider redirect.
    pub async fn start(
        &self,
        provider_name: &str,
        return_to: Option<String>,
    ) -> Result<AuthorizationRedirect, GatewayError> {
        let provider = self.provider(provider_name)?;
        if let Some(target) = &return_to {
            validate_return_to(target)?;
        }

        let state = random_token();
        let code_verifier = random_token();
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        let url = provider
            .authorization_url(&state, &code_challenge)
            .map_err(|e| GatewayError::ProviderError(e.to_string()))?;

        let handshake = HandshakeState::new(
            state.clone(),
            provider_name,
            return_to,
            code_verifier,
            self.settings.handshake_ttl,
        );
        self.handshakes.put(&handshake).await?;

        tracing::info!(provider = %provider_name, "Federated login started");
        Ok(AuthorizationRedirect {
            url,
            state,
            expires_at: handshake.expires_at,
        })
    }

    /// Resolve a provider callback into an identity and a token pair.
    ///
    /// Runs on its own task: if the caller goes away mid-exchange the flow
    /// still finishes, and every store write it makes is all-or-nothing.
    pub async fn callback(
        &self,
        provider_name: &str,
        state: &str,
        params: CallbackParams,
    ) -> Result<FederationOutcome, GatewayError> {
        let flow = self.clone();
        let provider_name = provider_name.to_string();
        let state = state.to_string();

        tokio::spawn(async move { flow.complete(&provider_name, &state, params).await })
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("federation task failed: {}", e)))?
    }

    async fn complete(
        &self,
        provider_name: &str,
        state: &str,
        params: CallbackParams,
    ) -> Result<FederationOutcome, GatewayError> {
        let Some(handshake) = self.handshakes.consume(state).await? else {
            tracing::warn!(provider = %provider_name, "Unknown or replayed handshake state");
            return Err(GatewayError::InvalidHandshakeState);
        };
        if handshake.provider != provider_name || handshake.is_expired() {
            tracing::warn!(
                provider = %provider_name,
                handshake_provider = %handshake.provider,
                "Handshake state rejected"
            );
            return Err(GatewayError::InvalidHandshakeState);
        }

        let provider = self.provider(provider_name)?;

        if let Some(error) = params.error {
            tracing::warn!(provider = %provider_name, error = %error, "Provider returned an error to the callback");
            return Err(GatewayError::ProviderError(format!(
                "{}: authorization failed: {}",
                provider_name, error
            )));
        }
        let code = params.code.filter(|c| !c.is_empty()).ok_or_else(|| {
            GatewayError::ProviderError(format!("{}: callback carried no code", provider_name))
        })?;

        let grant = AuthorizationGrant {
            code,
            code_verifier: handshake.code_verifier,
        };
        let profile = self.exchange(provider.as_ref(), &grant).await?;

        let (identity, created) = self.resolve_identity(provider_name, &profile).await?;
        let tokens = self.tokens.issue(&identity).await?;

        tracing::info!(
            provider = %provider_name,
            identity_id = %identity.id,
            created,
            "Federated login resolved"
        );
        Ok(FederationOutcome {
            identity,
            tokens,
            created,
            return_to: handshake.return_to,
        })
    }

    /// Code exchange then profile fetch, under one deadline. The code is
    /// single-use: it is resent only when the previous attempt never reached
    /// the provider. The profile fetch retries on any transient error.
    async fn exchange(
        &self,
        provider: &dyn IdentityProvider,
        grant: &AuthorizationGrant,
    ) -> Result<ProviderProfile, GatewayError> {
        let retry = &self.settings.retry;
        let attempt = async {
            let access = retry_with_backoff(retry, "oauth_code_exchange", || async move {
                provider.exchange_code(grant).await.map_err(SingleUseGrant)
            })
            .await
            .map_err(|SingleUseGrant(e)| e)?;

            retry_with_backoff(retry, "oauth_profile_fetch", || provider.fetch_profile(&access)).await
        };

        match tokio::time::timeout(self.settings.exchange_timeout, attempt).await {
            Ok(Ok(profile)) => Ok(profile),
            Ok(Err(e)) => {
                tracing::warn!(provider = %provider.name(), error = %e, "Provider exchange failed");
                Err(GatewayError::ProviderError(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(provider = %provider.name(), "Provider exchange timed out");
                Err(GatewayError::ProviderError(format!(
                    "{}: exchange timed out",
                    provider.name()
                )))
            }
        }
    }

    /// Existing link wins. Otherwise an email that both the provider and the
    /// local identity have verified links to that identity; any other email
    /// collision is a conflict; no email match creates a new identity.
    async fn resolve_identity(
        &self,
        provider: &str,
        profile: &ProviderProfile,
    ) -> Result<(Identity, bool), GatewayError> {
        if let Some(identity) = self.linked_identity(provider, &profile.subject_id).await? {
            return Ok((identity, false));
        }

        let target = match &profile.email {
            Some(email) => {
                let matches = self.identities.find_by_email(email).await?;
                match matches.as_slice() {
                    [] => LinkTarget::New(federated_identity(provider, profile)),
                    [existing] if profile.email_verified && existing.email_verified => {
                        LinkTarget::Existing(existing.id)
                    }
                    [_] => {
                        return Err(GatewayError::IdentityConflict(
                            "email belongs to an existing identity and is not verified on both sides"
                                .into(),
                        ))
                    }
                    _ => {
                        return Err(GatewayError::IdentityConflict(
                            "email matches more than one identity".into(),
                        ))
                    }
                }
            }
            None => LinkTarget::New(federated_identity(provider, profile)),
        };

        match self
            .identities
            .link_identity(provider, &profile.subject_id, target)
            .await
        {
            Ok(outcome) => {
                let created = matches!(outcome, LinkOutcome::Created(_));
                Ok((outcome.into_identity(), created))
            }
            Err(StoreError::Conflict(msg)) => {
                // a concurrent first login for the same subject may have won
                match self.linked_identity(provider, &profile.subject_id).await? {
                    Some(identity) => Ok((identity, false)),
                    None => Err(GatewayError::IdentityConflict(msg)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn linked_identity(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<Identity>, GatewayError> {
        let Some(link) = self.identities.find_link(provider, subject).await? else {
            return Ok(None);
        };
        let identity = self
            .identities
            .find_by_id(link.identity_id)
            .await?
            .ok_or_else(|| GatewayError::Store(anyhow::anyhow!("link points at a missing identity")))?;
        Ok(Some(identity))
    }
}

/// Code redemption failure, retryable only if the code never left.
struct SingleUseGrant(ProviderError);

impl Transient for SingleUseGrant {
    fn is_transient(&self) -> bool {
        self.0.request_never_sent()
    }
}

impl fmt::Display for SingleUseGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn federated_identity(provider: &str, profile: &ProviderProfile) -> Identity {
    let mut identity = Identity::new(Identity::federated_username(provider, &profile.subject_id))
        .with_role(DEFAULT_ROLE);
    if let Some(email) = &profile.email {
        identity = identity.with_email(email.clone(), profile.email_verified);
    }
    identity.name = profile.name.clone();
    identity.picture = profile.picture.clone();
    identity
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Only same-origin relative paths, so the callback cannot be turned into an
/// open redirect.
fn validate_return_to(target: &str) -> Result<(), GatewayError> {
    let ok = target.starts_with('/')
        && !target.starts_with("//")
        && !target.contains('\\')
        && !target.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(GatewayError::Validation(
            "return_to must be a relative path".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JwtConfig, ProviderCredentials, SigningKey};
    use crate::services::jwt::JwtService;
    use crate::services::providers::{
        OAuth2Provider, OAuthProviderConfig, ProfileFormat, ProviderAccess, ProviderErrorKind,
    };
    use crate::store::{
        MemoryFamilyLedger, MemoryHandshakeStore, MemoryIdentityStore, MemoryRevocationRegistry,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        name: String,
        /// code exchange results; an empty script accepts every code
        exchanges: Mutex<VecDeque<Result<(), ProviderError>>>,
        script: Mutex<VecDeque<Result<ProviderProfile, ProviderError>>>,
        exchange_calls: AtomicUsize,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<Result<ProviderProfile, ProviderError>>) -> Self {
            Self {
                name: name.into(),
                exchanges: Mutex::new(VecDeque::new()),
                script: Mutex::new(script.into()),
                exchange_calls: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn with_exchanges(self, exchanges: Vec<Result<(), ProviderError>>) -> Self {
            *self.exchanges.lock() = exchanges.into();
            self
        }
    }

    #[async_trait]
    impl IdentityProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String, ProviderError> {
            Ok(format!("https://idp.test/authorize?state={}&code_challenge={}", state, code_challenge))
        }

        async fn exchange_code(&self, grant: &AuthorizationGrant) -> Result<ProviderAccess, ProviderError> {
            assert!(!grant.code_verifier.is_empty());
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.exchanges.lock().pop_front().unwrap_or(Ok(()))?;
            Ok(ProviderAccess {
                access_token: "idp-access".into(),
            })
        }

        async fn fetch_profile(&self, access: &ProviderAccess) -> Result<ProviderProfile, ProviderError> {
            assert_eq!(access.access_token, "idp-access");
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script.lock().pop_front().unwrap_or_else(|| {
                Err(ProviderError::new(&self.name, ProviderErrorKind::Rejected, "script exhausted"))
            })
        }
    }

    fn profile(subject: &str, email: Option<&str>, verified: bool) -> ProviderProfile {
        ProviderProfile {
            subject_id: subject.into(),
            email: email.map(str::to_string),
            email_verified: verified,
            name: Some("Someone".into()),
            picture: None,
        }
    }

    fn transient() -> ProviderError {
        ProviderError::new("google", ProviderErrorKind::Transient, "503")
    }

    struct Fixture {
        flow: FederationFlow,
        identities: Arc<MemoryIdentityStore>,
        tokens: TokenLifecycleManager,
        provider: Arc<ScriptedProvider>,
    }

    fn build_flow(
        provider: Arc<dyn IdentityProvider>,
        timeout: Duration,
    ) -> (FederationFlow, Arc<MemoryIdentityStore>, TokenLifecycleManager) {
        let identities = Arc::new(MemoryIdentityStore::new());
        let jwt = JwtService::new(&JwtConfig {
            signing_key: SigningKey::Secret("test-signing-secret-with-at-least-32-bytes".into()),
            issuer: "auth-gateway".into(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        })
        .unwrap();
        let tokens = TokenLifecycleManager::new(
            jwt,
            identities.clone(),
            Arc::new(MemoryRevocationRegistry::new()),
            Arc::new(MemoryFamilyLedger::new()),
        );
        let flow = FederationFlow::new(
            vec![provider],
            Arc::new(MemoryHandshakeStore::new()),
            identities.clone(),
            tokens.clone(),
            FederationSettings {
                handshake_ttl: chrono::Duration::minutes(10),
                exchange_timeout: timeout,
                retry: RetryConfig {
                    max_retries: 2,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(2),
                    backoff_multiplier: 1.0,
                    add_jitter: false,
                },
            },
        );
        (flow, identities, tokens)
    }

    fn fixture_with(provider: ScriptedProvider, timeout: Duration) -> Fixture {
        let provider = Arc::new(provider);
        let (flow, identities, tokens) =
            build_flow(provider.clone() as Arc<dyn IdentityProvider>, timeout);
        Fixture {
            flow,
            identities,
            tokens,
            provider,
        }
    }

    fn fixture(script: Vec<Result<ProviderProfile, ProviderError>>) -> Fixture {
        fixture_with(ScriptedProvider::new("google", script), Duration::from_secs(5))
    }

    fn code() -> CallbackParams {
        CallbackParams {
            code: Some("auth-code".into()),
            error: None,
        }
    }

    #[tokio::test]
    async fn first_login_creates_identity_and_tokens() {
        let f = fixture(vec![Ok(profile("g-1", Some("new@x.com"), true))]);
        let redirect = f.flow.start("google", Some("/home".into())).await.unwrap();
        assert!(redirect.url.contains(&redirect.state));

        let outcome = f.flow.callback("google", &redirect.state, code()).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.identity.username, "google:g-1");
        assert_eq!(outcome.return_to.as_deref(), Some("/home"));

        let verified = f.tokens.verify(&outcome.tokens.access_token).await.unwrap();
        assert_eq!(verified.subject, outcome.identity.id);
    }

    #[tokio::test]
    async fn second_login_reuses_the_link() {
        let f = fixture(vec![
            Ok(profile("g-1", Some("new@x.com"), true)),
            Ok(profile("g-1", Some("changed@x.com"), true)),
        ]);
        let first = f.flow.start("google", None).await.unwrap();
        let a = f.flow.callback("google", &first.state, code()).await.unwrap();
        let second = f.flow.start("google", None).await.unwrap();
        let b = f.flow.callback("google", &second.state, code()).await.unwrap();

        assert_eq!(a.identity.id, b.identity.id);
        assert!(!b.created);
    }

    #[tokio::test]
    async fn replayed_state_is_rejected() {
        let f = fixture(vec![Ok(profile("g-1", None, false))]);
        let redirect = f.flow.start("google", None).await.unwrap();

        f.flow.callback("google", &redirect.state, code()).await.unwrap();
        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::InvalidHandshakeState)
        ));
    }

    #[tokio::test]
    async fn concurrent_callbacks_with_one_state_resolve_once() {
        let f = fixture(vec![
            Ok(profile("g-1", None, false)),
            Ok(profile("g-1", None, false)),
        ]);
        let redirect = f.flow.start("google", None).await.unwrap();

        let (a, b) = tokio::join!(
            f.flow.callback("google", &redirect.state, code()),
            f.flow.callback("google", &redirect.state, code())
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(GatewayError::InvalidHandshakeState))));
    }

    #[tokio::test]
    async fn state_is_bound_to_its_provider() {
        let f = fixture(vec![Ok(profile("g-1", None, false))]);
        let redirect = f.flow.start("google", None).await.unwrap();

        assert!(matches!(
            f.flow.callback("github", &redirect.state, code()).await,
            Err(GatewayError::InvalidHandshakeState)
        ));
        // consumed by the failed attempt
        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::InvalidHandshakeState)
        ));
    }

    #[tokio::test]
    async fn expired_state_is_rejected() {
        let f = fixture(vec![Ok(profile("g-1", None, false))]);
        let handshake = HandshakeState::new(
            "stale".into(),
            "google",
            None,
            "verifier".into(),
            chrono::Duration::seconds(-1),
        );
        f.flow.handshakes.put(&handshake).await.unwrap();

        assert!(matches!(
            f.flow.callback("google", "stale", code()).await,
            Err(GatewayError::InvalidHandshakeState)
        ));
    }

    #[tokio::test]
    async fn transient_profile_errors_are_retried_without_resending_the_code() {
        let f = fixture(vec![Err(transient()), Err(transient()), Ok(profile("g-1", None, false))]);
        let redirect = f.flow.start("google", None).await.unwrap();

        f.flow.callback("google", &redirect.state, code()).await.unwrap();
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.provider.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn code_is_resent_only_when_it_never_reached_the_provider() {
        let unreachable = ProviderError::new("google", ProviderErrorKind::Unreachable, "connect refused");
        let provider = ScriptedProvider::new("google", vec![Ok(profile("g-1", None, false))])
            .with_exchanges(vec![Err(unreachable), Ok(())]);
        let f = fixture_with(provider, Duration::from_secs(5));
        let redirect = f.flow.start("google", None).await.unwrap();
        f.flow.callback("google", &redirect.state, code()).await.unwrap();
        assert_eq!(f.provider.exchange_calls.load(Ordering::SeqCst), 2);

        let provider = ScriptedProvider::new("google", vec![Ok(profile("g-1", None, false))])
            .with_exchanges(vec![Err(transient()), Ok(())]);
        let f = fixture_with(provider, Duration::from_secs(5));
        let redirect = f.flow.start("google", None).await.unwrap();
        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::ProviderError(_))
        ));
        assert_eq!(f.provider.exchange_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_exchange_consumes_the_state() {
        let rejected = ProviderError::new("google", ProviderErrorKind::Rejected, "invalid_grant");
        let provider = ScriptedProvider::new("google", vec![Ok(profile("g-1", None, false))])
            .with_exchanges(vec![Err(rejected)]);
        let f = fixture_with(provider, Duration::from_secs(5));
        let redirect = f.flow.start("google", None).await.unwrap();

        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::ProviderError(_))
        ));
        assert_eq!(f.provider.exchange_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::InvalidHandshakeState)
        ));
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let mut provider = ScriptedProvider::new("google", vec![Ok(profile("g-1", None, false))]);
        provider.delay = Some(Duration::from_secs(5));
        let f = fixture_with(provider, Duration::from_millis(50));
        let redirect = f.flow.start("google", None).await.unwrap();

        assert!(matches!(
            f.flow.callback("google", &redirect.state, code()).await,
            Err(GatewayError::ProviderError(_))
        ));
        assert!(f.identities.find_link("google", "g-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_error_parameter_fails_the_flow() {
        let f = fixture(vec![]);
        let redirect = f.flow.start("google", None).await.unwrap();
        let params = CallbackParams {
            code: None,
            error: Some("access_denied".into()),
        };

        assert!(matches!(
            f.flow.callback("google", &redirect.state, params).await,
            Err(GatewayError::ProviderError(_))
        ));
        assert_eq!(f.provider.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn verified_email_links_to_verified_identity() {
        let f = fixture(vec![Ok(profile("g-9", Some("Admin@dpbdhub.com"), true))]);
        let admin = Identity::new("admin").with_email("admin@dpbdhub.com", true);
        f.identities.insert(&admin).await.unwrap();

        let redirect = f.flow.start("google", None).await.unwrap();
        let outcome = f.flow.callback("google", &redirect.state, code()).await.unwrap();

        assert_eq!(outcome.identity.id, admin.id);
        assert!(!outcome.created);
        assert_eq!(f.identities.links_for(admin.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unverified_email_collision_is_a_conflict() {
        let f = fixture(vec![
            Ok(profile("g-1", Some("tien@x.com"), false)),
            Ok(profile("g-2", Some("bp@x.com"), true)),
        ]);
        f.identities
            .insert(&Identity::new("tien").with_email("tien@x.com", true))
            .await
            .unwrap();
        f.identities
            .insert(&Identity::new("blackpresident").with_email("bp@x.com", false))
            .await
            .unwrap();

        for _ in 0..2 {
            let redirect = f.flow.start("google", None).await.unwrap();
            assert!(matches!(
                f.flow.callback("google", &redirect.state, code()).await,
                Err(GatewayError::IdentityConflict(_))
            ));
        }
    }

    #[tokio::test]
    async fn second_account_of_same_provider_conflicts() {
        let f = fixture(vec![
            Ok(profile("g-1", Some("admin@x.com"), true)),
            Ok(profile("g-2", Some("admin@x.com"), true)),
        ]);
        f.identities
            .insert(&Identity::new("admin").with_email("admin@x.com", true))
            .await
            .unwrap();

        let first = f.flow.start("google", None).await.unwrap();
        f.flow.callback("google", &first.state, code()).await.unwrap();

        let second = f.flow.start("google", None).await.unwrap();
        assert!(matches!(
            f.flow.callback("google", &second.state, code()).await,
            Err(GatewayError::IdentityConflict(_))
        ));
    }

    #[tokio::test]
    async fn unknown_provider_and_open_redirects_are_rejected() {
        let f = fixture(vec![]);
        assert!(matches!(
            f.flow.start("myspace", None).await,
            Err(GatewayError::NotFound(_))
        ));
        for target in ["https://evil.example", "//evil.example", "/\\evil"] {
            assert!(matches!(
                f.flow.start("google", Some(target.into())).await,
                Err(GatewayError::Validation(_))
            ));
        }
    }

    /// Token endpoint that redeems each code once, and a userinfo endpoint
    /// that fails its first call with 503.
    #[derive(Default)]
    struct IdpCounters {
        redeemed: Mutex<HashSet<String>>,
        code_posts: AtomicUsize,
        profile_calls: AtomicUsize,
    }

    async fn spawn_idp() -> (std::net::SocketAddr, Arc<IdpCounters>) {
        use axum::{
            extract::{Form, State},
            http::StatusCode,
            routing::{get, post},
            Json, Router,
        };

        let counters = Arc::new(IdpCounters::default());
        let app = Router::new()
            .route(
                "/token",
                post(
                    |State(idp): State<Arc<IdpCounters>>,
                     Form(form): Form<HashMap<String, String>>| async move {
                        idp.code_posts.fetch_add(1, Ordering::SeqCst);
                        let code = form.get("code").cloned().unwrap_or_default();
                        if idp.redeemed.lock().insert(code) {
                            (StatusCode::OK, Json(serde_json::json!({ "access_token": "idp-access" })))
                        } else {
                            (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "invalid_grant" })))
                        }
                    },
                ),
            )
            .route(
                "/userinfo",
                get(|State(idp): State<Arc<IdpCounters>>| async move {
                    if idp.profile_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})))
                    } else {
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({
                                "sub": "g-500",
                                "email": "idp@x.com",
                                "email_verified": true
                            })),
                        )
                    }
                }),
            )
            .with_state(counters.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, counters)
    }

    #[tokio::test]
    async fn profile_outage_recovers_with_a_single_code_redemption() {
        let (addr, idp) = spawn_idp().await;
        let provider = OAuth2Provider::new(
            OAuthProviderConfig {
                name: "google".into(),
                authorize_url: format!("http://{}/authorize", addr),
                token_url: format!("http://{}/token", addr),
                userinfo_url: format!("http://{}/userinfo", addr),
                scopes: vec!["openid".into()],
                format: ProfileFormat::OpenIdUserInfo,
                credentials: ProviderCredentials {
                    client_id: "client-123".into(),
                    client_secret: "secret".into(),
                    redirect_uri: "http://localhost:8080/oauth/google/auth".into(),
                },
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let (flow, _, _) = build_flow(Arc::new(provider), Duration::from_secs(5));

        let redirect = flow.start("google", None).await.unwrap();
        let outcome = flow.callback("google", &redirect.state, code()).await.unwrap();

        assert_eq!(outcome.identity.username, "google:g-500");
        assert_eq!(idp.code_posts.load(Ordering::SeqCst), 1);
        assert_eq!(idp.profile_calls.load(Ordering::SeqCst), 2);
    }
}
