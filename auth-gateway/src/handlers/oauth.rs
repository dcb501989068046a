use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use service_core::error::AppError;

use crate::{
    dtos::auth::{FederatedLoginResponse, OAuthCallbackQuery, OAuthLoginQuery, ProfileResponse},
    middleware::AuthUser,
    services::{CallbackParams, GatewayError},
    AppState,
};

/// Start a federated login: persist the handshake and redirect to the provider.
pub async fn login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthLoginQuery>,
) -> Result<Response, AppError> {
    let redirect = state.federation.start(&provider, query.return_to).await?;
    Ok(Redirect::to(&redirect.url).into_response())
}

/// Provider callback. Returns the token pair and sets the session cookie the
/// browser-facing routes authenticate with.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    jar: CookieJar,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<(CookieJar, Json<FederatedLoginResponse>), AppError> {
    let outcome = state
        .federation
        .callback(
            &provider,
            &query.state,
            CallbackParams {
                code: query.code,
                error: query.error,
            },
        )
        .await?;

    let cookie = Cookie::build((
        state.config.oauth.session_cookie.clone(),
        outcome.tokens.access_token.clone(),
    ))
    .path("/")
    .http_only(true)
    .secure(state.config.is_prod())
    .same_site(SameSite::Lax)
    .max_age(time::Duration::seconds(outcome.tokens.expires_in))
    .build();

    Ok((
        jar.add(cookie),
        Json(FederatedLoginResponse {
            identity: outcome.identity.sanitized(),
            created: outcome.created,
            return_to: outcome.return_to,
            tokens: outcome.tokens,
        }),
    ))
}

/// Profile of the session's identity together with its provider links.
pub async fn field(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    AuthUser(principal): AuthUser,
) -> Result<Json<ProfileResponse>, AppError> {
    let links = state
        .identities
        .store()
        .links_for(principal.identity.id)
        .await
        .map_err(GatewayError::from)?;

    Ok(Json(ProfileResponse {
        provider_linked: links.iter().any(|link| link.provider == provider),
        provider,
        identity: principal.identity.sanitized(),
        links,
    }))
}
