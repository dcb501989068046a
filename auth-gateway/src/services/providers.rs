//! External identity providers.
//!
//! Every provider is reached through [`IdentityProvider`]; the built-in ones
//! are one [`OAuth2Provider`] parameterised by [`OAuthProviderConfig`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use service_core::retry::Transient;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProviderCredentials;

/// What the callback received from the provider, plus the PKCE verifier
/// recovered from the handshake.
#[derive(Debug, Clone)]
pub struct AuthorizationGrant {
    pub code: String,
    pub code_verifier: String,
}

/// Provider access token obtained by redeeming an authorization code.
#[derive(Clone)]
pub struct ProviderAccess {
    pub access_token: String,
}

impl std::fmt::Debug for ProviderAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAccess")
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub subject_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The connection was never established, so the request was not sent.
    Unreachable,
    /// Timeout, 5xx or 429. Worth retrying an idempotent call.
    Transient,
    /// The provider refused the grant.
    Rejected,
    /// The provider answered with something we could not use.
    Malformed,
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: &str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            kind,
            message: message.into(),
        }
    }

    fn from_reqwest(provider: &str, stage: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_connect() {
            ProviderErrorKind::Unreachable
        } else if err.is_timeout() || err.is_request() {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Malformed
        };
        Self::new(provider, kind, format!("{} failed: {}", stage, err))
    }

    fn from_status(provider: &str, stage: &str, status: reqwest::StatusCode) -> Self {
        let kind = if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Rejected
        };
        Self::new(provider, kind, format!("{} returned {}", stage, status))
    }

    /// Whether a request that failed this way may be sent again even when it
    /// carried a single-use authorization code.
    pub fn request_never_sent(&self) -> bool {
        self.kind == ProviderErrorKind::Unreachable
    }
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Unreachable | ProviderErrorKind::Transient
        )
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Where to send the browser, carrying `state` and the S256 challenge.
    fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String, ProviderError>;

    /// Redeem the authorization code. Codes are single-use, so callers must
    /// not resend a grant the provider may already have seen.
    async fn exchange_code(&self, grant: &AuthorizationGrant) -> Result<ProviderAccess, ProviderError>;

    /// Fetch and map the profile behind `access`. Safe to repeat.
    async fn fetch_profile(&self, access: &ProviderAccess) -> Result<ProviderProfile, ProviderError>;
}

/// How a provider's profile document maps onto [`ProviderProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    /// OpenID Connect userinfo (`sub`, `email`, `email_verified`, ...)
    OpenIdUserInfo,
    /// GitHub `/user`, with `/user/emails` for the primary verified address
    GitHub,
    /// Facebook Graph `/me?fields=id,name,email,picture`
    Facebook,
}

#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub name: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    pub format: ProfileFormat,
    pub credentials: ProviderCredentials,
}

impl OAuthProviderConfig {
    pub fn google(credentials: ProviderCredentials) -> Self {
        Self {
            name: "google".into(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".into(),
            scopes: vec!["openid".into(), "email".into(), "profile".into()],
            format: ProfileFormat::OpenIdUserInfo,
            credentials,
        }
    }

    pub fn github(credentials: ProviderCredentials) -> Self {
        Self {
            name: "github".into(),
            authorize_url: "https://github.com/login/oauth/authorize".into(),
            token_url: "https://github.com/login/oauth/access_token".into(),
            userinfo_url: "https://api.github.com/user".into(),
            scopes: vec!["read:user".into(), "user:email".into()],
            format: ProfileFormat::GitHub,
            credentials,
        }
    }

    pub fn facebook(credentials: ProviderCredentials) -> Self {
        Self {
            name: "facebook".into(),
            authorize_url: "https://www.facebook.com/v19.0/dialog/oauth".into(),
            token_url: "https://graph.facebook.com/v19.0/oauth/access_token".into(),
            userinfo_url: "https://graph.facebook.com/me?fields=id,name,email,picture".into(),
            scopes: vec!["email".into(), "public_profile".into()],
            format: ProfileFormat::Facebook,
            credentials,
        }
    }
}

const GITHUB_EMAILS_URL: &str = "https://api.github.com/user/emails";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

pub struct OAuth2Provider {
    config: OAuthProviderConfig,
    http: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(config: OAuthProviderConfig, request_timeout: Duration) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("auth-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    async fn redeem_code(&self, grant: &AuthorizationGrant) -> Result<String, ProviderError> {
        let name = self.config.name.as_str();
        let creds = &self.config.credentials;

        let res = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("code", grant.code.as_str()),
                ("code_verifier", grant.code_verifier.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", creds.redirect_uri.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(name, "token exchange", e))?;

        if !res.status().is_success() {
            return Err(ProviderError::from_status(name, "token exchange", res.status()));
        }

        let body: TokenResponse = res
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(name, "token response", e))?;

        match (body.access_token, body.error) {
            (Some(token), None) => Ok(token),
            (_, Some(error)) => Err(ProviderError::new(
                name,
                ProviderErrorKind::Rejected,
                format!(
                    "token exchange rejected: {} {}",
                    error,
                    body.error_description.unwrap_or_default()
                ),
            )),
            (None, None) => Err(ProviderError::new(
                name,
                ProviderErrorKind::Malformed,
                "token response has no access_token",
            )),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
        stage: &str,
    ) -> Result<T, ProviderError> {
        let name = self.config.name.as_str();
        let res = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(name, stage, e))?;

        if !res.status().is_success() {
            return Err(ProviderError::from_status(name, stage, res.status()));
        }

        res.json()
            .await
            .map_err(|e| ProviderError::from_reqwest(name, stage, e))
    }
}

#[async_trait]
impl IdentityProvider for OAuth2Provider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String, ProviderError> {
        let scope = self.config.scopes.join(" ");
        let creds = &self.config.credentials;
        let url = reqwest::Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", creds.client_id.as_str()),
                ("redirect_uri", creds.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
                ("code_challenge", code_challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| {
            ProviderError::new(
                &self.config.name,
                ProviderErrorKind::Malformed,
                format!("bad authorize url: {}", e),
            )
        })?;
        Ok(url.into())
    }

    async fn exchange_code(&self, grant: &AuthorizationGrant) -> Result<ProviderAccess, ProviderError> {
        let access_token = self.redeem_code(grant).await?;
        Ok(ProviderAccess { access_token })
    }

    async fn fetch_profile(&self, access: &ProviderAccess) -> Result<ProviderProfile, ProviderError> {
        let access_token = access.access_token.as_str();
        let document: Value = self
            .get_json(&self.config.userinfo_url, access_token, "profile fetch")
            .await?;

        let mut profile = map_profile(&self.config.name, self.config.format, &document)?;

        if self.config.format == ProfileFormat::GitHub && !profile.email_verified {
            let emails: Vec<GitHubEmail> = self
                .get_json(GITHUB_EMAILS_URL, access_token, "email fetch")
                .await?;
            if let Some((email, verified)) = pick_github_email(&emails) {
                profile.email = Some(email);
                profile.email_verified = verified;
            }
        }

        Ok(profile)
    }
}

fn str_field(doc: &Value, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Map a provider profile document. Pure, so each format is testable
/// without a network.
pub fn map_profile(
    provider: &str,
    format: ProfileFormat,
    doc: &Value,
) -> Result<ProviderProfile, ProviderError> {
    let missing = || {
        ProviderError::new(
            provider,
            ProviderErrorKind::Malformed,
            "profile has no subject id",
        )
    };

    let profile = match format {
        ProfileFormat::OpenIdUserInfo => ProviderProfile {
            subject_id: str_field(doc, "sub").ok_or_else(missing)?,
            email: str_field(doc, "email"),
            email_verified: doc
                .get("email_verified")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            name: str_field(doc, "name"),
            picture: str_field(doc, "picture"),
        },
        ProfileFormat::GitHub => {
            // GitHub ids are numbers
            let subject_id = doc
                .get("id")
                .and_then(|id| id.as_u64().map(|n| n.to_string()).or_else(|| id.as_str().map(str::to_string)))
                .ok_or_else(missing)?;
            ProviderProfile {
                subject_id,
                email: str_field(doc, "email"),
                // the public profile email carries no verification flag
                email_verified: false,
                name: str_field(doc, "name").or_else(|| str_field(doc, "login")),
                picture: str_field(doc, "avatar_url"),
            }
        }
        ProfileFormat::Facebook => ProviderProfile {
            subject_id: str_field(doc, "id").ok_or_else(missing)?,
            // Graph does not say whether the address was confirmed
            email_verified: false,
            email: str_field(doc, "email"),
            name: str_field(doc, "name"),
            picture: doc
                .pointer("/picture/data/url")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    };

    Ok(profile)
}

fn pick_github_email(emails: &[GitHubEmail]) -> Option<(String, bool)> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .or_else(|| emails.iter().find(|e| e.verified))
        .or_else(|| emails.iter().find(|e| e.primary))
        .map(|e| (e.email.clone(), e.verified))
}
