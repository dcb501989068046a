use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;

use crate::{
    dtos::policy::{
        GroupPolicyRequest, MembersResponse, MutationResponse, PolicyRequest, RolesResponse,
    },
    models::{identity::SUBJECT_PREFIX, GroupingRule, PolicyRule},
    services::GatewayError,
    utils::ValidatedJson,
    AppState,
};

fn mutation_status(changed: bool) -> StatusCode {
    if changed {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    }
}

pub async fn list_policies(State(state): State<AppState>) -> Json<Vec<PolicyRule>> {
    Json(state.policies.list_policies())
}

pub async fn add_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = PolicyRule::new(req.role, req.resource, req.action)?;
    let changed = state.policies.add_policy(&rule).await?;
    Ok((mutation_status(changed), Json(MutationResponse { changed })))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<PolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = PolicyRule::new(req.role, req.resource, req.action)?;
    let changed = state.policies.delete_policy(&rule).await?;
    Ok((StatusCode::OK, Json(MutationResponse { changed })))
}

pub async fn list_group_policies(State(state): State<AppState>) -> Json<Vec<GroupingRule>> {
    Json(state.policies.list_group_policies())
}

pub async fn add_group_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<GroupPolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = GroupingRule::new(req.role, req.member)?;
    let changed = state.policies.add_group_policy(&rule).await?;
    Ok((mutation_status(changed), Json(MutationResponse { changed })))
}

pub async fn delete_group_policy(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<GroupPolicyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let rule = GroupingRule::new(req.role, req.member)?;
    let changed = state.policies.delete_group_policy(&rule).await?;
    Ok((StatusCode::OK, Json(MutationResponse { changed })))
}

/// Direct members of a role.
pub async fn role_members(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Json<MembersResponse> {
    let members = state.policies.snapshot().members_of(&role);
    Json(MembersResponse { role, members })
}

/// Effective role set of a role, or of an identity given as `user:<username>`
/// (its assigned roles included).
pub async fn effective_roles(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<RolesResponse>, AppError> {
    let identity = match subject.strip_prefix(SUBJECT_PREFIX) {
        Some(username) => state
            .identities
            .store()
            .find_by_username(username)
            .await
            .map_err(GatewayError::from)?,
        None => None,
    };
    let roles = match identity {
        Some(identity) => state.enforcer.effective_roles_for(&identity),
        None => state.enforcer.effective_roles(&subject),
    };
    Ok(Json(RolesResponse {
        subject,
        roles: roles.into_iter().collect(),
    }))
}
