pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod store;
pub mod utils;

use service_core::axum::{
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::middleware::{
    authorize_middleware, bearer_auth_middleware, session_auth_middleware, RequestGate,
};
use crate::services::{
    seed, FederationFlow, FederationSettings, IdentityProvider, IdentityService, JwtService,
    OAuth2Provider, OAuthProviderConfig, PolicyEnforcer, PolicyStore, TokenLifecycleManager,
};
use crate::store::Stores;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub identities: IdentityService,
    pub tokens: TokenLifecycleManager,
    pub policies: Arc<PolicyStore>,
    pub enforcer: PolicyEnforcer,
    pub federation: FederationFlow,
    pub gate: RequestGate,
    pub login_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the services over `stores`, then seed according to the config.
    pub async fn new(
        config: GatewayConfig,
        stores: Stores,
        providers: Vec<Arc<dyn IdentityProvider>>,
    ) -> Result<Self, AppError> {
        let jwt = JwtService::new(&config.jwt).map_err(AppError::ConfigError)?;

        let identities = IdentityService::new(stores.identities.clone());
        let tokens = TokenLifecycleManager::new(
            jwt,
            stores.identities.clone(),
            stores.revocations,
            stores.families,
        );

        let policies = Arc::new(PolicyStore::load(stores.policies).await?);
        let enforcer = PolicyEnforcer::new(policies.clone());

        let federation = FederationFlow::new(
            providers,
            stores.handshakes,
            stores.identities.clone(),
            tokens.clone(),
            FederationSettings {
                handshake_ttl: chrono::Duration::seconds(config.oauth.handshake_ttl_seconds),
                exchange_timeout: Duration::from_secs(config.oauth.exchange_timeout_seconds),
                retry: RetryConfig::quick(config.oauth.exchange_max_retries),
            },
        );

        let gate = RequestGate::new(tokens.clone(), stores.identities, enforcer.clone());

        seed::run(&config.seed, &policies, &identities).await?;

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        );

        Ok(Self {
            config,
            identities,
            tokens,
            policies,
            enforcer,
            federation,
            gate,
            login_rate_limiter,
        })
    }
}

/// The OAuth providers with credentials in `config`.
pub fn configured_providers(
    config: &GatewayConfig,
) -> Result<Vec<Arc<dyn IdentityProvider>>, AppError> {
    let request_timeout = Duration::from_secs(config.oauth.exchange_timeout_seconds);
    let oauth = &config.oauth;

    let configs = [
        oauth.google.clone().map(OAuthProviderConfig::google),
        oauth.github.clone().map(OAuthProviderConfig::github),
        oauth.facebook.clone().map(OAuthProviderConfig::facebook),
    ];

    configs
        .into_iter()
        .flatten()
        .map(|provider_config| {
            tracing::info!(provider = %provider_config.name, "OAuth provider enabled");
            OAuth2Provider::new(provider_config, request_timeout)
                .map(|p| Arc::new(p) as Arc<dyn IdentityProvider>)
                .map_err(AppError::ConfigError)
        })
        .collect()
}

pub fn build_router(state: AppState) -> Router {
    let login_route = Router::new()
        .route("/login/token", post(handlers::token::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let bearer_routes = Router::new()
        .route("/jwt/logout", post(handlers::token::logout))
        .route_layer(from_fn_with_state(state.clone(), bearer_auth_middleware));

    // authorization is keyed on (path, method); route_layer runs bottom-up
    let policy_routes = Router::new()
        .route(
            "/jwt/auth/policy",
            get(handlers::policy::list_policies)
                .post(handlers::policy::add_policy)
                .delete(handlers::policy::delete_policy),
        )
        .route(
            "/jwt/auth/grouppolicy",
            get(handlers::policy::list_group_policies)
                .post(handlers::policy::add_group_policy)
                .delete(handlers::policy::delete_group_policy),
        )
        .route(
            "/jwt/auth/grouppolicy/:role",
            get(handlers::policy::role_members),
        )
        .route(
            "/jwt/auth/roles/:subject",
            get(handlers::policy::effective_roles),
        )
        .route_layer(from_fn_with_state(state.clone(), authorize_middleware))
        .route_layer(from_fn_with_state(state.clone(), bearer_auth_middleware));

    let session_routes = Router::new()
        .route("/oauth/:provider/field", get(handlers::oauth::field))
        .route_layer(from_fn_with_state(state.clone(), authorize_middleware))
        .route_layer(from_fn_with_state(state.clone(), session_auth_middleware));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/register", post(handlers::token::register))
        .route("/jwt/refresh", post(handlers::token::refresh))
        .route("/oauth/:provider/login", get(handlers::oauth::login))
        .route("/oauth/:provider/auth", get(handlers::oauth::callback))
        .merge(login_route)
        .merge(bearer_routes)
        .merge(policy_routes)
        .merge(session_routes)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config))
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins = config
        .security
        .allowed_origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
