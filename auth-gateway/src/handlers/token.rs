use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::{
    dtos::{
        auth::{LoginRequest, LogoutRequest, RefreshRequest, RegisterRequest},
        MessageResponse,
    },
    middleware::AuthUser,
    services::NewIdentity,
    utils::{Password, ValidatedJson},
    AppState,
};

/// Create a local identity with a password.
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state
        .identities
        .register(NewIdentity {
            username: req.username,
            password: Password::new(req.password),
            name: req.name,
            email: req.email,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(identity.sanitized())))
}

/// Username and password in, token pair out.
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state
        .identities
        .authenticate(&req.username, Password::new(req.password))
        .await?;
    let pair = state.tokens.issue(&identity).await?;
    tracing::info!(identity_id = %identity.id, "Credential login");
    Ok((StatusCode::OK, Json(pair)))
}

/// Revoke the caller's token family, and the family of the refresh token in
/// the body when it is the caller's own.
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    body: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    state
        .tokens
        .revoke_family(principal.token.family_id)
        .await?;

    if let Some(refresh) = body.and_then(|Json(req)| req.refresh_token) {
        match state
            .tokens
            .revoke_owned(&refresh, principal.identity.id)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_authentication_failure() => {
                tracing::debug!(error = %e, "Ignoring unusable refresh token on logout");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(
        identity_id = %principal.identity.id,
        family = %principal.token.family_id,
        "Logged out"
    );
    Ok((StatusCode::OK, Json(MessageResponse::new("Logged out successfully"))))
}

/// Rotate a refresh token. Needs no access token.
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let pair = state.tokens.rotate(&req.refresh_token).await?;
    Ok((StatusCode::OK, Json(pair)))
}
