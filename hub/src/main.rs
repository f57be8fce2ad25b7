use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod hub;
mod models;
mod protocol;

use config::HubConfig;
use hub::Hub;

/// Application state for the server
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: HubConfig,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowlink_hub=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = HubConfig::load();
    info!("Starting FlowLink Hub v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration: {}:{} ({})",
        config.host, config.port, config.environment
    );

    let hub = Arc::new(Hub::new(config.clone()));

    // Start the expiry/grace sweep task
    hub::sweeper::spawn(hub.clone());

    let app_state = AppState {
        hub,
        config: config.clone(),
        start_time: Instant::now(),
    };

    let mut routes = Router::new()
        .route("/ws", get(api::websocket_handler))
        .route("/health", get(api::health_check));
    if config.is_development() {
        routes = routes.route("/debug", get(api::debug_dump));
    }
    let app = routes
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("FlowLink Hub listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received. Terminating...");
    }
}
