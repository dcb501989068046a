use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub oauth: OAuthConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

/// How tokens are signed.
#[derive(Clone, PartialEq)]
pub enum SigningKey {
    Secret(String),
    RsaPemFiles {
        private_key_path: String,
        public_key_path: String,
    },
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningKey::Secret(_) => f.write_str("Secret(<redacted>)"),
            SigningKey::RsaPemFiles {
                private_key_path,
                public_key_path,
            } => f
                .debug_struct("RsaPemFiles")
                .field("private_key_path", private_key_path)
                .field("public_key_path", public_key_path)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub signing_key: SigningKey,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
}

#[derive(Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub handshake_ttl_seconds: i64,
    pub exchange_timeout_seconds: u64,
    pub exchange_max_retries: u32,
    pub session_cookie: String,
    pub google: Option<ProviderCredentials>,
    pub github: Option<ProviderCredentials>,
    pub facebook: Option<ProviderCredentials>,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SeedConfig {
    pub default_policies: bool,
    pub demo_identities: bool,
    pub demo_password: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let signing_key = match env::var("JWT_SIGNING_SECRET") {
            Ok(secret) => SigningKey::Secret(secret),
            Err(_) => SigningKey::RsaPemFiles {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
            },
        };

        let config = GatewayConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("auth-gateway"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: optional_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            jwt: JwtConfig {
                signing_key,
                issuer: get_env("JWT_ISSUER", Some("auth-gateway"), false)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    Some("15"),
                    false,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    Some("7"),
                    false,
                )?,
            },
            storage: StorageConfig {
                backend: parse_env("STORAGE_BACKEND", Some("memory"), is_prod)?,
                database_url: optional_env("DATABASE_URL"),
                database_max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), false)?,
                redis_url: optional_env("REDIS_URL"),
            },
            oauth: OAuthConfig {
                handshake_ttl_seconds: parse_env("OAUTH_HANDSHAKE_TTL_SECONDS", Some("600"), false)?,
                exchange_timeout_seconds: parse_env(
                    "OAUTH_EXCHANGE_TIMEOUT_SECONDS",
                    Some("10"),
                    false,
                )?,
                exchange_max_retries: parse_env("OAUTH_EXCHANGE_MAX_RETRIES", Some("2"), false)?,
                session_cookie: get_env("OAUTH_SESSION_COOKIE", Some("gateway_session"), false)?,
                google: provider_credentials("GOOGLE")?,
                github: provider_credentials("GITHUB")?,
                facebook: provider_credentials("FACEBOOK")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            rate_limit: RateLimitConfig {
                login_attempts: parse_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), false)?,
                login_window_seconds: parse_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    false,
                )?,
            },
            seed: SeedConfig {
                default_policies: parse_env("SEED_DEFAULT_POLICIES", Some("true"), false)?,
                demo_identities: parse_env("SEED_DEMO_IDENTITIES", Some("false"), false)?,
                demo_password: optional_env("SEED_DEMO_PASSWORD"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.oauth.handshake_ttl_seconds <= 0 || self.oauth.exchange_timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OAuth handshake TTL and exchange timeout must be positive"
            )));
        }

        if self.rate_limit.login_attempts == 0 || self.rate_limit.login_window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Login rate limit attempts and window must be positive"
            )));
        }

        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required when STORAGE_BACKEND=postgres"
            )));
        }

        if let SigningKey::Secret(secret) = &self.jwt.signing_key {
            if secret.len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "JWT_SIGNING_SECRET must be at least 32 bytes"
                )));
            }
        }

        if self.seed.demo_identities && self.seed.demo_password.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SEED_DEMO_PASSWORD is required when SEED_DEMO_IDENTITIES is enabled"
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.storage.backend == StorageBackend::Memory {
                tracing::error!("In-memory storage in production - state is lost on restart");
            }

            if self.seed.demo_identities {
                tracing::warn!("Demo identities are seeded in production");
            }
        }

        Ok(())
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// A provider is enabled when its client id is set; the other two settings
/// are then required.
fn provider_credentials(prefix: &str) -> Result<Option<ProviderCredentials>, AppError> {
    let Some(client_id) = optional_env(&format!("{}_CLIENT_ID", prefix)) else {
        return Ok(None);
    };
    Ok(Some(ProviderCredentials {
        client_id,
        client_secret: get_env(&format!("{}_CLIENT_SECRET", prefix), None, false)?,
        redirect_uri: get_env(&format!("{}_REDIRECT_URI", prefix), None, false)?,
    }))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" => Ok(StorageBackend::Postgres),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}
