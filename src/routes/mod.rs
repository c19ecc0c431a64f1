pub mod detect;
pub mod results;

use axum::{Router, extract::DefaultBodyLimit, routing::get};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::AppState;

async fn health() -> &'static str {
    "ok"
}

/// Build all routes for the API
pub fn build_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(detect::routes())
        .merge(results::routes())
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
