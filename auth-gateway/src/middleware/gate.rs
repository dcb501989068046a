//! Request gate: authentication (401) strictly before authorization (403).
//!
//! `bearer_auth_middleware` or `session_auth_middleware` resolves a
//! [`Principal`] and stores it in the request extensions;
//! `authorize_middleware` then enforces `(subject, path, method)` for it.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::sync::Arc;

use crate::models::Identity;
use crate::services::{GatewayError, PolicyEnforcer, TokenLifecycleManager, VerifiedToken};
use crate::store::IdentityStore;
use crate::AppState;

/// An authenticated caller: the live token and the identity as stored now.
#[derive(Debug, Clone)]
pub struct Principal {
    pub identity: Identity,
    pub token: VerifiedToken,
}

#[derive(Clone)]
pub struct RequestGate {
    tokens: TokenLifecycleManager,
    identities: Arc<dyn IdentityStore>,
    enforcer: PolicyEnforcer,
}

impl RequestGate {
    pub fn new(
        tokens: TokenLifecycleManager,
        identities: Arc<dyn IdentityStore>,
        enforcer: PolicyEnforcer,
    ) -> Self {
        Self {
            tokens,
            identities,
            enforcer,
        }
    }

    /// Verify the access token and load its identity. Roles come from the
    /// identity store, never from the token.
    pub async fn authenticate(&self, access_token: &str) -> Result<Principal, GatewayError> {
        let token = self.tokens.verify(access_token).await?;
        let identity = self
            .identities
            .find_by_id(token.subject)
            .await?
            .filter(|identity| identity.active)
            .ok_or(GatewayError::TokenRevoked)?;

        Ok(Principal { identity, token })
    }

    pub fn authorize(
        &self,
        principal: &Principal,
        resource: &str,
        action: &str,
    ) -> Result<(), GatewayError> {
        if self
            .enforcer
            .enforce_for(&principal.identity, resource, action)
            .is_allowed()
        {
            Ok(())
        } else {
            tracing::warn!(
                identity_id = %principal.identity.id,
                resource = %resource,
                action = %action,
                "Request denied by policy"
            );
            Err(GatewayError::PolicyDenied)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn missing_credentials(what: &str) -> AppError {
    AppError::Unauthorized(anyhow::anyhow!("Missing {}", what))
}

/// Require a valid bearer access token.
pub async fn bearer_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())
        .ok_or_else(|| missing_credentials("or invalid Authorization header"))?;

    let principal = state.gate.authenticate(token).await?;
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

/// Browser equivalent of [`bearer_auth_middleware`]: the access token rides
/// in the session cookie set by the federation callback.
pub async fn session_auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = jar
        .get(&state.config.oauth.session_cookie)
        .map(|cookie| cookie.value().to_string())
        .ok_or_else(|| missing_credentials("session"))?;

    let principal = state.gate.authenticate(&token).await?;
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

/// Enforce `(subject, request path, request method)`. Must run after one of
/// the authentication middlewares.
pub async fn authorize_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let principal = req
        .extensions()
        .get::<Principal>()
        .ok_or_else(|| missing_credentials("credentials"))?;

    state
        .gate
        .authorize(principal, req.uri().path(), req.method().as_str())?;

    Ok(next.run(req).await)
}

/// Extractor for the principal resolved by the gate.
pub struct AuthUser(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| missing_credentials("credentials"))?;

        Ok(AuthUser(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
