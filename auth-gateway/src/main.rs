use auth_gateway::{build_router, config::GatewayConfig, configured_providers, store::Stores, AppState};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::net::SocketAddr;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = GatewayConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(AppError::ConfigError)?;

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        storage = ?config.storage.backend,
        "Starting auth gateway"
    );

    let stores = Stores::connect(&config.storage, &config.service_name)
        .await
        .map_err(AppError::DatabaseError)?;
    let providers = configured_providers(&config)?;

    let addr = config.common.listen_addr();
    let state = AppState::new(config, stores, providers).await?;
    let app = build_router(state);

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
