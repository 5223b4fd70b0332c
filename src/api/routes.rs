//! Route definitions for the API.

use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers;
use super::middleware::audit::audit_middleware;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    let openapi = handlers::audit_logs::ApiDoc::openapi();
    let audit_state = state.audit.clone();

    let api_v1 = Router::new().nest("/audit-logs", handlers::audit_logs::router());

    let router = Router::new()
        // Health endpoints (excluded from auditing by default config)
        .route("/health", get(handlers::health::health_check))
        .route("/livez", get(handlers::health::liveness_check))
        // OpenAPI spec and Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api/v1/openapi.json", openapi))
        // API v1 routes
        .nest("/api/v1", api_v1)
        // The interceptor wraps every route; exclusions are decided inside
        // so the list stays configuration, not routing.
        .layer(middleware::from_fn_with_state(audit_state, audit_middleware));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
