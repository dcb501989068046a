//! Local identities: registration, credential login and administration.

use std::sync::Arc;
use uuid::Uuid;

use super::GatewayError;
use crate::models::identity::FEDERATED_SEPARATOR;
use crate::models::policy::require_role_name;
use crate::models::{Identity, DEFAULT_ROLE};
use crate::store::IdentityStore;
use crate::utils::{hash_password, verify_password, Password};

#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
}

/// Input for [`IdentityService::register`].
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub username: String,
    pub password: Password,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl IdentityService {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn register(&self, new: NewIdentity) -> Result<Identity, GatewayError> {
        let username = new.username.trim().to_string();
        if username.is_empty() {
            return Err(GatewayError::Validation("username must not be empty".into()));
        }
        // federated identities own every name containing the separator
        if username.contains(FEDERATED_SEPARATOR) {
            return Err(GatewayError::Validation(format!(
                "username must not contain '{}'",
                FEDERATED_SEPARATOR
            )));
        }

        let password = new.password;
        let hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| GatewayError::Internal(e.into()))??;

        let mut identity = Identity::new(username)
            .with_password_hash(hash)
            .with_role(DEFAULT_ROLE);
        identity.name = new.name;
        if let Some(email) = new.email {
            // unverified until a provider vouches for it
            identity = identity.with_email(email, false);
        }

        self.store.insert(&identity).await?;
        tracing::info!(identity_id = %identity.id, username = %identity.username, "Identity registered");
        Ok(identity)
    }

    /// Unknown usernames, wrong passwords, password-less identities and
    /// deactivated identities all fail the same way.
    pub async fn authenticate(
        &self,
        username: &str,
        password: Password,
    ) -> Result<Identity, GatewayError> {
        let identity = self
            .store
            .find_by_username(username.trim())
            .await?
            .ok_or(GatewayError::InvalidCredentials)?;

        let Some(hash) = identity.password_hash.clone() else {
            return Err(GatewayError::InvalidCredentials);
        };

        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| GatewayError::Internal(e.into()))??;

        if !verified || !identity.active {
            tracing::warn!(username = %identity.username, "Credential login rejected");
            return Err(GatewayError::InvalidCredentials);
        }

        Ok(identity)
    }

    pub async fn find(&self, id: Uuid) -> Result<Identity, GatewayError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Identity".into()))
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Identity, GatewayError> {
        self.store
            .find_by_username(username)
            .await?
            .ok_or_else(|| GatewayError::NotFound("Identity".into()))
    }

    pub async fn assign_role(&self, id: Uuid, role: &str) -> Result<Identity, GatewayError> {
        let role = role.trim();
        require_role_name(role)?;
        let mut identity = self.find(id).await?;
        if identity.roles.insert(role.to_string()) {
            identity.touch();
            self.store.update(&identity).await?;
            tracing::info!(identity_id = %id, role = %role, "Role assigned");
        }
        Ok(identity)
    }

    pub async fn remove_role(&self, id: Uuid, role: &str) -> Result<Identity, GatewayError> {
        let mut identity = self.find(id).await?;
        if identity.roles.remove(role.trim()) {
            identity.touch();
            self.store.update(&identity).await?;
            tracing::info!(identity_id = %id, role = %role, "Role removed");
        }
        Ok(identity)
    }

    /// Logical delete. Outstanding tokens stop authenticating because the
    /// gate loads the identity on every request.
    pub async fn deactivate(&self, id: Uuid) -> Result<Identity, GatewayError> {
        let mut identity = self.find(id).await?;
        if identity.active {
            identity.active = false;
            identity.touch();
            self.store.update(&identity).await?;
            tracing::info!(identity_id = %id, "Identity deactivated");
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIdentityStore;

    fn service() -> IdentityService {
        IdentityService::new(Arc::new(MemoryIdentityStore::new()))
    }

    fn new_identity(username: &str, password: &str) -> NewIdentity {
        NewIdentity {
            username: username.into(),
            password: Password::new(password.into()),
            name: None,
            email: Some("Tien@Example.com".into()),
        }
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let service = service();
        let registered = service.register(new_identity("tien", "correct horse")).await.unwrap();
        assert_eq!(registered.email.as_deref(), Some("tien@example.com"));
        assert!(!registered.email_verified);

        let authenticated = service
            .authenticate("tien", Password::new("correct horse".into()))
            .await
            .unwrap();
        assert_eq!(authenticated.id, registered.id);
    }

    #[tokio::test]
    async fn bad_credentials_are_indistinguishable() {
        let service = service();
        service.register(new_identity("tien", "correct horse")).await.unwrap();

        for (user, pass) in [("tien", "wrong"), ("nobody", "correct horse")] {
            assert!(matches!(
                service.authenticate(user, Password::new(pass.into())).await,
                Err(GatewayError::InvalidCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let service = service();
        service.register(new_identity("tien", "a")).await.unwrap();
        assert!(matches!(
            service.register(new_identity("tien", "b")).await,
            Err(GatewayError::IdentityConflict(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_identity_cannot_log_in() {
        let service = service();
        let identity = service.register(new_identity("tien", "pw")).await.unwrap();
        service.deactivate(identity.id).await.unwrap();

        assert!(matches!(
            service.authenticate("tien", Password::new("pw".into())).await,
            Err(GatewayError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn role_assignment_round_trip() {
        let service = service();
        let identity = service.register(new_identity("admin", "pw")).await.unwrap();

        let updated = service.assign_role(identity.id, "admin").await.unwrap();
        assert!(updated.roles.contains("admin"));
        assert!(service.find(identity.id).await.unwrap().roles.contains("admin"));

        let updated = service.remove_role(identity.id, "admin").await.unwrap();
        assert_eq!(updated.roles.len(), 1);
        assert!(updated.roles.contains(DEFAULT_ROLE));
        for bad in [" ", "user:admin"] {
            assert!(matches!(
                service.assign_role(identity.id, bad).await,
                Err(GatewayError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn federated_usernames_cannot_be_registered() {
        let service = service();
        assert!(matches!(
            service.register(new_identity("google:g-77", "pw")).await,
            Err(GatewayError::Validation(_))
        ));
        service.register(new_identity("google_g-77", "pw")).await.unwrap();
    }
}
