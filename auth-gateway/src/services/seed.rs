//! Startup bootstrap: default admin policies and optional demo identities.
//! Safe to run on every start; existing tuples and usernames are left alone.

use super::identity::{IdentityService, NewIdentity};
use super::policy::PolicyStore;
use super::GatewayError;
use crate::config::SeedConfig;
use crate::models::{GroupingRule, PolicyRule, DEFAULT_ROLE};
use crate::utils::Password;

pub const ADMIN_ROLE: &str = "admin";

const DEFAULT_POLICIES: &[(&str, &str, &str)] = &[
    (ADMIN_ROLE, "/jwt/auth/policy", "GET"),
    (ADMIN_ROLE, "/jwt/auth/policy", "POST"),
    (ADMIN_ROLE, "/jwt/auth/policy", "DELETE"),
    (ADMIN_ROLE, "/jwt/auth/grouppolicy", "GET"),
    (ADMIN_ROLE, "/jwt/auth/grouppolicy", "POST"),
    (ADMIN_ROLE, "/jwt/auth/grouppolicy", "DELETE"),
    (ADMIN_ROLE, "/jwt/auth/grouppolicy/*", "GET"),
    (ADMIN_ROLE, "/jwt/auth/roles/*", "GET"),
    (DEFAULT_ROLE, "/oauth/*", "GET"),
];

/// `(role, member)`: admins hold everything the default role holds.
const DEFAULT_GROUPINGS: &[(&str, &str)] = &[(DEFAULT_ROLE, ADMIN_ROLE)];

/// `(username, email, email_verified, holds the admin role)`
const DEMO_IDENTITIES: &[(&str, &str, bool, bool)] = &[
    ("tien", "tienbm90@gmail.com", false, false),
    ("blackpresident", "blackpresident90@gmail.com", false, false),
    ("admin", "admin@dpbdhub.com", true, true),
];

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    /// Policies and groupings that were not present before.
    pub policies_added: usize,
    pub identities_created: usize,
}

pub async fn run(
    config: &SeedConfig,
    policies: &PolicyStore,
    identities: &IdentityService,
) -> Result<SeedReport, GatewayError> {
    let mut report = SeedReport::default();

    if config.default_policies {
        for (role, resource, action) in DEFAULT_POLICIES {
            let rule = PolicyRule::new(*role, *resource, *action)?;
            if policies.add_policy(&rule).await? {
                report.policies_added += 1;
            }
        }
        for (role, member) in DEFAULT_GROUPINGS {
            if policies
                .add_group_policy(&GroupingRule::new(*role, *member)?)
                .await?
            {
                report.policies_added += 1;
            }
        }
    }

    if config.demo_identities {
        let password = config.demo_password.clone().ok_or_else(|| {
            GatewayError::Validation("demo identities need a demo password".into())
        })?;

        for (username, email, verified, admin) in DEMO_IDENTITIES {
            if identities.store().find_by_username(username).await?.is_some() {
                continue;
            }
            let mut identity = identities
                .register(NewIdentity {
                    username: username.to_string(),
                    password: Password::new(password.clone()),
                    name: Some(username.to_string()),
                    email: None,
                })
                .await?;

            identity = identity.with_email(*email, *verified);
            if *admin {
                identity.roles.insert(ADMIN_ROLE.to_string());
            }
            identities.store().update(&identity).await?;
            report.identities_created += 1;
        }
    }

    tracing::info!(
        policies_added = report.policies_added,
        identities_created = report.identities_created,
        "Seed complete"
    );
    Ok(report)
}
