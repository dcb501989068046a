//! Policy and grouping tuples.

use serde::{Deserialize, Serialize};

use super::identity::SUBJECT_PREFIX;
use crate::services::GatewayError;

/// `(role, resource-pattern, action)`: members of `role` may perform `action`
/// on resources matching `resource`.
///
/// A resource ending in `/*` matches every resource that starts with the part
/// before the `*`, so `/jwt/auth/grouppolicy/*` covers
/// `/jwt/auth/grouppolicy/5` but not `/jwt/auth/grouppolicy`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    pub role: String,
    pub resource: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(
        role: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let rule = Self {
            role: role.into().trim().to_string(),
            resource: resource.into().trim().to_string(),
            action: action.into().trim().to_uppercase(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        require_role_name(&self.role)?;
        require_non_empty("resource", &self.resource)?;
        require_non_empty("action", &self.action)?;
        if self.resource.contains('*') && !self.resource.ends_with("/*") {
            return Err(GatewayError::Validation(
                "resource wildcard must be a trailing '/*'".to_string(),
            ));
        }
        Ok(())
    }

    /// Actions compare case-insensitively, so `get` and `GET` are one action.
    pub fn matches_action(&self, action: &str) -> bool {
        self.action.eq_ignore_ascii_case(action)
    }
}

/// `(role, member)`: `member` inherits `role`. A member is either another
/// role or an identity written as `user:<username>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupingRule {
    pub role: String,
    pub member: String,
}

impl GroupingRule {
    pub fn new(role: impl Into<String>, member: impl Into<String>) -> Result<Self, GatewayError> {
        let rule = Self {
            role: role.into().trim().to_string(),
            member: member.into().trim().to_string(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        require_role_name(&self.role)?;
        require_non_empty("member", &self.member)?;
        if self.role == self.member {
            return Err(GatewayError::Validation(
                "a role cannot be a member of itself".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.is_empty() {
        return Err(GatewayError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Role names are non-empty and stay out of the identity namespace.
pub fn require_role_name(role: &str) -> Result<(), GatewayError> {
    require_non_empty("role", role)?;
    if role.starts_with(SUBJECT_PREFIX) {
        return Err(GatewayError::Validation(format!(
            "role names must not start with '{}'",
            SUBJECT_PREFIX
        )));
    }
    Ok(())
}

pub fn resource_matches(pattern: &str, resource: &str) -> bool {
    if pattern == resource {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => resource.starts_with(prefix),
        _ => false,
    }
}
