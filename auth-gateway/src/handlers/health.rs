use axum::{extract::State, Json};
use service_core::error::AppError;

use crate::AppState;

pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.identities.store().health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Identity store health check failed");
        AppError::ServiceUnavailable
    })?;

    state.tokens.registry().health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Revocation registry health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "environment": format!("{:?}", state.config.environment),
        "providers": state.federation.provider_names(),
    })))
}
