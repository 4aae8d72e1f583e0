//! Application router configuration.

use axum::{
    routing::{get, post},
    Router,
};

use super::types::{ServerState, MAX_REQUEST_BODY_SIZE};
use crate::handlers::{basic, extensions};

/// Create the application router with a specific state.
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/api/health", get(basic::health_handler))
        // Static paths before `:id` captures.
        .route("/api/extensions", get(extensions::list_extensions_handler))
        .route(
            "/api/extensions/discover",
            post(extensions::discover_extensions_handler),
        )
        .route(
            "/api/extensions/tools",
            get(extensions::list_extension_tools_handler),
        )
        .route(
            "/api/extensions/:id",
            get(extensions::get_extension_handler).delete(extensions::unload_extension_handler),
        )
        .route(
            "/api/extensions/:id/reload",
            post(extensions::reload_extension_handler),
        )
        .route(
            "/api/extensions/:id/health",
            get(extensions::extension_health_handler),
        )
        .route(
            "/api/extensions/:id/metrics",
            get(extensions::extension_metrics_handler),
        )
        .route(
            "/api/extensions/:id/command",
            post(extensions::execute_extension_command_handler),
        )
        .route(
            "/api/extensions/:id/config",
            get(extensions::get_extension_config_handler)
                .put(extensions::update_extension_config_handler),
        )
        .route(
            "/api/extensions/:id/circuit/reset",
            post(extensions::reset_extension_circuit_handler),
        )
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            MAX_REQUEST_BODY_SIZE,
        ))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
