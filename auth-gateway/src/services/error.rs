use service_core::error::AppError;
use thiserror::Error;

use crate::store::StoreError;

/// Failure kinds of the token, policy and federation core.
///
/// Authentication failures (`401`) and authorization failures (`403`) stay
/// distinct so clients can tell "log in again" from "not permitted".
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token invalid")]
    TokenInvalid,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Refresh token reused")]
    TokenReused,

    #[error("Policy denied")]
    PolicyDenied,

    #[error("Invalid handshake state")]
    InvalidHandshakeState,

    #[error("Identity provider error: {0}")]
    ProviderError(String),

    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Authentication failures, as opposed to authorization or server failures.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidCredentials
                | GatewayError::TokenExpired
                | GatewayError::TokenInvalid
                | GatewayError::TokenRevoked
                | GatewayError::TokenReused
        )
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => GatewayError::IdentityConflict(msg),
            StoreError::Backend(e) => GatewayError::Store(e),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidCredentials => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid credentials"))
            }
            GatewayError::TokenExpired => AppError::Unauthorized(anyhow::anyhow!("Token expired")),
            GatewayError::TokenInvalid => AppError::Unauthorized(anyhow::anyhow!("Invalid token")),
            GatewayError::TokenRevoked => AppError::Unauthorized(anyhow::anyhow!("Token revoked")),
            GatewayError::TokenReused => AppError::Unauthorized(anyhow::anyhow!(
                "Refresh token reuse detected, please log in again"
            )),
            GatewayError::PolicyDenied => AppError::Forbidden(anyhow::anyhow!("Permission denied")),
            GatewayError::InvalidHandshakeState => {
                AppError::BadRequest(anyhow::anyhow!("Invalid or expired login state"))
            }
            GatewayError::ProviderError(e) => AppError::BadGateway(e),
            GatewayError::IdentityConflict(e) => AppError::Conflict(anyhow::anyhow!(e)),
            GatewayError::Validation(e) => AppError::BadRequest(anyhow::anyhow!(e)),
            GatewayError::NotFound(what) => {
                AppError::NotFound(anyhow::anyhow!("{} not found", what))
            }
            GatewayError::Store(e) => AppError::DatabaseError(e),
            GatewayError::Internal(e) => AppError::InternalError(e),
        }
    }
}
