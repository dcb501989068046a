use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{ExternalLink, IdentityResponse};
use crate::services::TokenPair;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    pub username: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,

    pub name: Option<String>,

    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthLoginQuery {
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub state: String,
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Body of a successful federated login.
#[derive(Debug, Serialize, Deserialize)]
pub struct FederatedLoginResponse {
    pub identity: IdentityResponse,
    pub created: bool,
    pub return_to: Option<String>,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub provider: String,
    pub provider_linked: bool,
    pub identity: IdentityResponse,
    pub links: Vec<ExternalLink>,
}
