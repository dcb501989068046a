//! PostgreSQL identity and policy tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

use super::{IdentityStore, LinkOutcome, LinkTarget, PolicyRepository, StoreError};
use crate::models::identity::normalize_email;
use crate::models::{ExternalLink, GroupingRule, Identity, PolicyRule};

/// Create a PostgreSQL connection pool.
pub async fn create_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");

    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    username: String,
    password_hash: Option<String>,
    name: Option<String>,
    email: Option<String>,
    email_verified: bool,
    picture: Option<String>,
    roles: Vec<String>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Identity {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            name: row.name,
            email: row.email,
            email_verified: row.email_verified,
            picture: row.picture,
            roles: row.roles.into_iter().collect(),
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    provider: String,
    subject: String,
    identity_id: Uuid,
    linked_at: DateTime<Utc>,
}

impl From<LinkRow> for ExternalLink {
    fn from(row: LinkRow) -> Self {
        ExternalLink {
            provider: row.provider,
            subject: row.subject,
            identity_id: row.identity_id,
            linked_at: row.linked_at,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

const INSERT_IDENTITY: &str = r#"
    INSERT INTO identities
        (id, username, password_hash, name, email, email_verified, picture, roles, active, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
"#;

fn bind_identity<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    identity: &'q Identity,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(identity.id)
        .bind(&identity.username)
        .bind(&identity.password_hash)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(identity.email_verified)
        .bind(&identity.picture)
        .bind(identity.roles.iter().cloned().collect::<Vec<String>>())
        .bind(identity.active)
        .bind(identity.created_at)
        .bind(identity.updated_at)
}

#[derive(Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, identity: &Identity) -> Result<(), StoreError> {
        match bind_identity(sqlx::query(INSERT_IDENTITY), identity)
            .execute(&self.pool)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "username '{}' is taken",
                identity.username
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, identity: &Identity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE identities
            SET name = $2, email = $3, email_verified = $4, picture = $5, roles = $6,
                active = $7, password_hash = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(identity.id)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(identity.email_verified)
        .bind(&identity.picture)
        .bind(identity.roles.iter().cloned().collect::<Vec<String>>())
        .bind(identity.active)
        .bind(&identity.password_hash)
        .bind(identity.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Identity::from))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, IdentityRow>("SELECT * FROM identities WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Identity::from))
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<Identity>, StoreError> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM identities WHERE LOWER(email) = $1 ORDER BY created_at",
        )
        .bind(normalize_email(email))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Identity::from).collect())
    }

    async fn find_link(
        &self,
        provider: &str,
        subject: &str,
    ) -> Result<Option<ExternalLink>, StoreError> {
        let row = sqlx::query_as::<_, LinkRow>(
            "SELECT * FROM external_links WHERE provider = $1 AND subject = $2",
        )
        .bind(provider)
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ExternalLink::from))
    }

    async fn links_for(&self, identity_id: Uuid) -> Result<Vec<ExternalLink>, StoreError> {
        let rows = sqlx::query_as::<_, LinkRow>(
            "SELECT * FROM external_links WHERE identity_id = $1 ORDER BY provider",
        )
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ExternalLink::from).collect())
    }

    async fn link_identity(
        &self,
        provider: &str,
        subject: &str,
        target: LinkTarget,
    ) -> Result<LinkOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let (identity, created) = match target {
            LinkTarget::Existing(id) => {
                let row = sqlx::query_as::<_, IdentityRow>(
                    "SELECT * FROM identities WHERE id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("identity {} does not exist", id)))?;
                (Identity::from(row), false)
            }
            LinkTarget::New(identity) => {
                if let Err(e) = bind_identity(sqlx::query(INSERT_IDENTITY), &identity)
                    .execute(&mut *tx)
                    .await
                {
                    if is_unique_violation(&e) {
                        return Err(StoreError::Conflict(format!(
                            "username '{}' is taken",
                            identity.username
                        )));
                    }
                    return Err(e.into());
                }
                (identity, true)
            }
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO external_links (provider, subject, identity_id, linked_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, subject) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(subject)
        .bind(identity.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(result) if result.rows_affected() == 1 => {
                tx.commit().await?;
                Ok(if created {
                    LinkOutcome::Created(identity)
                } else {
                    LinkOutcome::Linked(identity)
                })
            }
            Ok(_) => {
                // a concurrent callback linked the pair first; drop our writes
                tx.rollback().await?;
                let link = self.find_link(provider, subject).await?.ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!("link vanished after conflict"))
                })?;
                let existing = self.find_by_id(link.identity_id).await?.ok_or_else(|| {
                    StoreError::Backend(anyhow::anyhow!("link points at a missing identity"))
                })?;
                Ok(LinkOutcome::Existing(existing))
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "identity is already linked to another {} account",
                provider
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone)]
pub struct PgPolicyRepository {
    pool: PgPool,
}

impl PgPolicyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyRepository for PgPolicyRepository {
    async fn load(&self) -> Result<(Vec<PolicyRule>, Vec<GroupingRule>), StoreError> {
        let policies = sqlx::query_as::<_, (String, String, String)>(
            "SELECT role, resource, action FROM policies ORDER BY role, resource, action",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(role, resource, action)| PolicyRule {
            role,
            resource,
            action,
        })
        .collect();

        let groupings = sqlx::query_as::<_, (String, String)>(
            "SELECT role, member FROM group_policies ORDER BY role, member",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(role, member)| GroupingRule { role, member })
        .collect();

        Ok((policies, groupings))
    }

    async fn insert_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO policies (role, resource, action) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(&rule.role)
        .bind(&rule.resource)
        .bind(&rule.action)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_policy(&self, rule: &PolicyRule) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM policies WHERE role = $1 AND resource = $2 AND action = $3",
        )
        .bind(&rule.role)
        .bind(&rule.resource)
        .bind(&rule.action)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO group_policies (role, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&rule.role)
        .bind(&rule.member)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_grouping(&self, rule: &GroupingRule) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM group_policies WHERE role = $1 AND member = $2")
            .bind(&rule.role)
            .bind(&rule.member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
