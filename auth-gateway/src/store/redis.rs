//! Redis-backed revocation registry, family ledger and handshake store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client, Script};
use uuid::Uuid;

use super::{Advance, FamilyLedger, HandshakeStore, RevocationRegistry, StoreError};
use crate::models::{HandshakeState, TokenFamily};

const ADVANCE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'current')
if not current then return 'unknown' end
if redis.call('HGET', KEYS[1], 'revoked') == '1' then return 'revoked' end
if current ~= ARGV[1] then return 'reused' end
redis.call('HSET', KEYS[1], 'current', ARGV[2], 'rotated_at', ARGV[3], 'expires_at', ARGV[4])
redis.call('EXPIREAT', KEYS[1], ARGV[4])
return 'advanced'
"#;

// HSET on a missing key would resurrect it without a TTL
const REVOKE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'revoked', '1')
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn new(url: &str, key_prefix: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            manager,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, kind: &str, id: impl std::fmt::Display) -> String {
        format!("{}:{}:{}", self.key_prefix, kind, id)
    }

    async fn set_with_expiry(&self, key: String, value: String, ttl_seconds: i64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: String) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await?;
        Ok(exists)
    }
}

#[async_trait]
impl RevocationRegistry for RedisStore {
    async fn revoke_token(&self, jti: Uuid, ttl_seconds: i64) -> Result<(), StoreError> {
        let key = self.key("revoked:token", jti);
        self.set_with_expiry(key, Utc::now().timestamp().to_string(), ttl_seconds)
            .await
    }

    async fn revoke_family(&self, family_id: Uuid, ttl_seconds: i64) -> Result<(), StoreError> {
        let key = self.key("revoked:family", family_id);
        self.set_with_expiry(key, Utc::now().timestamp().to_string(), ttl_seconds)
            .await
    }

    async fn is_token_revoked(&self, jti: Uuid) -> Result<bool, StoreError> {
        self.exists(self.key("revoked:token", jti)).await
    }

    async fn is_family_revoked(&self, family_id: Uuid) -> Result<bool, StoreError> {
        self.exists(self.key("revoked:family", family_id)).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Redis health check failed: {}", e)))
    }
}

#[async_trait]
impl FamilyLedger for RedisStore {
    async fn open(&self, family: &TokenFamily) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key = self.key("family", family.family_id);
        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("subject")
            .arg(family.subject.to_string())
            .arg("current")
            .arg(family.current_refresh_jti.to_string())
            .arg("created_at")
            .arg(family.created_at.timestamp())
            .arg("expires_at")
            .arg(family.expires_at.timestamp())
            .arg("revoked")
            .arg("0")
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(family.ttl_seconds())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn advance(
        &self,
        family_id: Uuid,
        presented: Uuid,
        next: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<Advance, StoreError> {
        let mut conn = self.manager.clone();
        let outcome: String = Script::new(ADVANCE_SCRIPT)
            .key(self.key("family", family_id))
            .arg(presented.to_string())
            .arg(next.to_string())
            .arg(Utc::now().timestamp())
            .arg(expires_at.timestamp())
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_str() {
            "advanced" => Ok(Advance::Advanced),
            "reused" => Ok(Advance::Reused),
            "revoked" => Ok(Advance::Revoked),
            "unknown" => Ok(Advance::Unknown),
            other => Err(StoreError::Backend(anyhow::anyhow!(
                "unexpected ledger script result '{}'",
                other
            ))),
        }
    }

    async fn revoke(&self, family_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = Script::new(REVOKE_SCRIPT)
            .key(self.key("family", family_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HandshakeStore for RedisStore {
    async fn put(&self, handshake: &HandshakeState) -> Result<(), StoreError> {
        let value = serde_json::to_string(handshake).map_err(|e| StoreError::Backend(e.into()))?;
        self.set_with_expiry(
            self.key("handshake", &handshake.state),
            value,
            handshake.ttl_seconds(),
        )
        .await
    }

    async fn consume(&self, state: &str) -> Result<Option<HandshakeState>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(self.key("handshake", state))
            .query_async(&mut conn)
            .await?;
        raw.map(|r| serde_json::from_str(&r).map_err(|e| StoreError::Backend(e.into())))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn connect() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::new(&url, &format!("test:{}", Uuid::new_v4()))
            .await
            .unwrap()
    }

    async fn family_field(store: &RedisStore, family_id: Uuid, field: &str) -> Option<String> {
        let mut conn = store.manager.clone();
        redis::cmd("HGET")
            .arg(store.key("family", family_id))
            .arg(field)
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    async fn ttl(store: &RedisStore, family_id: Uuid) -> i64 {
        let mut conn = store.manager.clone();
        redis::cmd("TTL")
            .arg(store.key("family", family_id))
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn ledger_script_detects_reuse() {
        let store = connect().await;
        let first = Uuid::new_v4();
        let family = TokenFamily::new(Uuid::new_v4(), first, Utc::now() + Duration::minutes(1));
        store.open(&family).await.unwrap();

        let second = Uuid::new_v4();
        let later = Utc::now() + Duration::days(1);
        assert_eq!(
            store.advance(family.family_id, first, second, later).await.unwrap(),
            Advance::Advanced
        );
        assert_eq!(
            store.advance(family.family_id, first, second, later).await.unwrap(),
            Advance::Reused
        );
        assert_eq!(
            family_field(&store, family.family_id, "current").await,
            Some(second.to_string())
        );
        // the key lives as long as the newest refresh token
        assert!(ttl(&store, family.family_id).await > 3600);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn revoking_a_missing_family_writes_nothing() {
        let store = connect().await;
        let missing = Uuid::new_v4();
        store.revoke(missing).await.unwrap();
        assert_eq!(ttl(&store, missing).await, -2);

        let family = TokenFamily::new(Uuid::new_v4(), Uuid::new_v4(), Utc::now() + Duration::days(1));
        store.open(&family).await.unwrap();
        store.revoke(family.family_id).await.unwrap();
        assert_eq!(family_field(&store, family.family_id, "revoked").await.as_deref(), Some("1"));
        assert!(ttl(&store, family.family_id).await > 0);
        assert_eq!(
            store
                .advance(family.family_id, family.current_refresh_jti, Uuid::new_v4(), Utc::now())
                .await
                .unwrap(),
            Advance::Revoked
        );
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn handshake_getdel_consumes_once() {
        let store = connect().await;
        let handshake = HandshakeState::new("s1".into(), "github", None, "v".into(), Duration::minutes(5));
        store.put(&handshake).await.unwrap();
        assert!(store.consume("s1").await.unwrap().is_some());
        assert!(store.consume("s1").await.unwrap().is_none());
    }
}
