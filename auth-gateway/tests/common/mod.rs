//! Shared setup for the router-level integration tests: an in-memory
//! `AppState`, a scripted identity provider and request helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use auth_gateway::{
    build_router,
    config::{
        Environment, GatewayConfig, JwtConfig, OAuthConfig, RateLimitConfig, SecurityConfig,
        SeedConfig, SigningKey, StorageBackend, StorageConfig,
    },
    services::{
        providers::{AuthorizationGrant, ProviderAccess, ProviderError, ProviderErrorKind},
        IdentityProvider, ProviderProfile, TokenPair,
    },
    store::Stores,
    AppState,
};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tower::util::ServiceExt;

pub const DEMO_PASSWORD: &str = "demo-password-1";

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "auth-gateway-test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        jwt: JwtConfig {
            signing_key: SigningKey::Secret("integration-test-secret-at-least-32-bytes".into()),
            issuer: "auth-gateway".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        storage: StorageConfig {
            backend: StorageBackend::Memory,
            database_url: None,
            database_max_connections: 1,
            redis_url: None,
        },
        oauth: OAuthConfig {
            handshake_ttl_seconds: 600,
            exchange_timeout_seconds: 5,
            exchange_max_retries: 1,
            session_cookie: "gateway_session".to_string(),
            google: None,
            github: None,
            facebook: None,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        rate_limit: RateLimitConfig {
            login_attempts: 100,
            login_window_seconds: 60,
        },
        seed: SeedConfig {
            default_policies: true,
            demo_identities: true,
            demo_password: Some(DEMO_PASSWORD.to_string()),
        },
    }
}

/// Identity provider that replays a fixed list of login results. A scripted
/// error fails the code exchange; a scripted profile is returned by the
/// profile fetch that follows it.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<ProviderProfile, ProviderError>>>,
    exchanged: Mutex<VecDeque<ProviderProfile>>,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            exchanged: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, result: Result<ProviderProfile, ProviderError>) {
        self.script.lock().push_back(result);
    }

    pub fn push_profile(&self, subject: &str, email: Option<&str>, verified: bool) {
        self.push(Ok(ProviderProfile {
            subject_id: subject.to_string(),
            email: email.map(str::to_string),
            email_verified: verified,
            name: Some("Federated User".to_string()),
            picture: None,
        }));
    }

    pub fn push_rejection(&self) {
        self.push(Err(ProviderError::new(
            &self.name,
            ProviderErrorKind::Rejected,
            "invalid_grant",
        )));
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> Result<String, ProviderError> {
        Ok(format!(
            "https://idp.test/authorize?state={}&code_challenge={}",
            state, code_challenge
        ))
    }

    async fn exchange_code(&self, _grant: &AuthorizationGrant) -> Result<ProviderAccess, ProviderError> {
        let next = self.script.lock().pop_front().unwrap_or_else(|| {
            Err(ProviderError::new(
                &self.name,
                ProviderErrorKind::Rejected,
                "script exhausted",
            ))
        });
        self.exchanged.lock().push_back(next?);
        Ok(ProviderAccess {
            access_token: "scripted-access".to_string(),
        })
    }

    async fn fetch_profile(&self, _access: &ProviderAccess) -> Result<ProviderProfile, ProviderError> {
        self.exchanged.lock().pop_front().ok_or_else(|| {
            ProviderError::new(&self.name, ProviderErrorKind::Malformed, "no exchanged profile")
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub google: Arc<ScriptedProvider>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: GatewayConfig) -> Self {
        let google = Arc::new(ScriptedProvider::new("google"));
        let state = AppState::new(
            config,
            Stores::in_memory(),
            vec![google.clone() as Arc<dyn IdentityProvider>],
        )
        .await
        .expect("Failed to build app state");

        Self {
            router: build_router(state.clone()),
            state,
            google,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed")
    }

    /// JSON request with an optional bearer token; returns status and body.
    pub async fn json(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.send(request).await;
        let status = response.status();
        (status, read_json(response).await)
    }

    pub async fn login(&self, username: &str, password: &str) -> TokenPair {
        let (status, body) = self
            .json(
                Method::POST,
                "/login/token",
                None,
                Some(serde_json::json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {}", body);
        serde_json::from_value(body).unwrap()
    }

    pub async fn login_demo(&self, username: &str) -> TokenPair {
        self.login(username, DEMO_PASSWORD).await
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}
