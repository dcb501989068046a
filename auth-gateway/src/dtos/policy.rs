use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct PolicyRequest {
    #[validate(length(min = 1, message = "Role is required"))]
    pub role: String,

    #[validate(length(min = 1, message = "Resource is required"))]
    pub resource: String,

    #[validate(length(min = 1, message = "Action is required"))]
    pub action: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GroupPolicyRequest {
    #[validate(length(min = 1, message = "Role is required"))]
    pub role: String,

    #[validate(length(min = 1, message = "Member is required"))]
    pub member: String,
}

/// Result of an idempotent mutation: `changed` is false when the tuple was
/// already present (add) or already absent (delete).
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResponse {
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub role: String,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RolesResponse {
    pub subject: String,
    pub roles: Vec<String>,
}
