//! # HTTP Server
//!
//! Axum router assembly and shared application state. The state holds one
//! [`ModelManager`] behind an `Arc` — the only process-wide object the
//! handlers need — plus the loaded configuration.

use crate::config::Config;
use crate::handlers;
use axum::routing::{get, post};
use axum::Router;
use relay_dispatch::manager::ModelManager;
use relay_dispatch::store::SharedStore;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<ModelManager>,
    pub started_at: Instant,
}

/// Build the application: connect the shared store when configured, load
/// instances and routes into the manager, start the periodic health
/// checker, and assemble the router.
pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    let store = match &config.store.url {
        Some(url) if !url.is_empty() => match SharedStore::connect(url).await {
            Ok(store) => Some(store),
            Err(e) => {
                // Degrade to in-memory tracking rather than refusing to start.
                tracing::warn!(error = %e, "shared store unreachable, using in-memory tracking");
                None
            }
        },
        _ => None,
    };

    let manager = Arc::new(ModelManager::new(config.routing.clone(), store));
    manager.load(config.instances.clone())?;
    for route in &config.routes {
        if let Err(e) = manager.register_route(route.clone()) {
            tracing::warn!(slug = %route.slug, error = %e, "skipping invalid route");
        }
    }
    manager.start_health_checker();

    tracing::info!(
        instances = config.instances.len(),
        routes = config.routes.len(),
        strategy = %config.routing.routing_strategy,
        "gateway initialized"
    );

    let state = AppState {
        manager,
        started_at: Instant::now(),
        config: Arc::new(config),
    };

    let timeout = state.config.server.timeout;
    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(timeout)),
        )
        .with_state(state);

    Ok(app)
}
