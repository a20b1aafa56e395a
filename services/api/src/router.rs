//! Axum Router Configuration
//!
//! Operational REST routes, the WebSocket endpoint and the OpenAPI document.

use crate::{
    handlers,
    models::{ErrorResponse, HealthResponse, MessageRole, SessionSummary, StoredMessage},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_sessions,
        handlers::get_session,
    ),
    components(
        schemas(HealthResponse, SessionSummary, StoredMessage, MessageRole, ErrorResponse)
    ),
    tags(
        (name = "Companion API", description = "Operational endpoints for the companion session engine")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
