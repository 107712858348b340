//! API Routes
//!
//! Configures the Axum router with all dashboard endpoints.

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    clear_tenant_handler, create_handler, delete_handler, health_handler, invalidate_handler,
    list_handler, stats_handler, update_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /tenants/:tenant/:kind` - List a collection (cache first)
/// - `POST /tenants/:tenant/:kind` - Create an item
/// - `PUT /tenants/:tenant/:kind/:id` - Update an item
/// - `DELETE /tenants/:tenant/:kind/:id` - Delete an item
/// - `POST /tenants/:tenant/:kind/invalidate` - Drop one cached collection
/// - `DELETE /tenants/:tenant/cache` - Drop every cached collection of a tenant
/// - `GET /stats` - Read statistics per collection
/// - `GET /health` - Remote connection state
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tenants/:tenant/cache", delete(clear_tenant_handler))
        .route(
            "/tenants/:tenant/:kind",
            get(list_handler).post(create_handler),
        )
        .route(
            "/tenants/:tenant/:kind/invalidate",
            post(invalidate_handler),
        )
        .route(
            "/tenants/:tenant/:kind/:id",
            put(update_handler).delete(delete_handler),
        )
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
