//! RTM Reference Collector
//!
//! Receives signed alerts from agents over HTTPS POST, verifies the HMAC,
//! deduplicates by `(agent_id, id)` and keeps them in memory for query.
//! TLS is terminated in front of this process.
//!
//! # Routes
//!
//! ```text
//! GET  /health                         liveness + stored alert count
//! POST /api/v1/ingest                  SignedEnvelope from an agent
//! GET  /api/v1/alerts                  ?agent_id=&severity=&limit=
//! GET  /api/v1/alerts/:agent_id/:id    one alert
//! ```

mod config;
mod error;
mod handlers;
mod models;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{CorsLayer, Any},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{AppError, AppResult};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "rtm_collector=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("RTM Collector starting (max {} alerts in memory)...", config.max_alerts);

    let state = AppState {
        store: Arc::new(store::AlertStore::new(config.max_alerts)),
        config: Arc::new(config),
    };
    let port = state.config.port;
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<store::AlertStore>,
    pub config: Arc<config::Config>,
}

/// Create the main router with all routes
fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::check))
        .route("/api/v1/ingest", post(handlers::ingest::ingest))
        .route("/api/v1/alerts", get(handlers::alerts::list))
        .route("/api/v1/alerts/:agent_id/:id", get(handlers::alerts::get))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}
