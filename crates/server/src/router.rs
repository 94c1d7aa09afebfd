//! HTTP router construction.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::state::AppState;

/// Largest accepted `/predict` payload.
const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(api::home))
        .route("/health", get(api::health))
        .route("/predict", post(api::predict))
        .route("/logs", get(api::logs))
        .layer(DefaultBodyLimit::max(MAX_PAYLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
