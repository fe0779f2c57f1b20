use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod handlers;

/// Build the token API router.
/// All routes are relative — the caller mounts this under `/api`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tokens/activate", post(handlers::activate))
        .route("/tokens", get(handlers::list_tokens))
        .route("/tokens/:id", get(handlers::show_token))
        .route("/tokens/:id/history", get(handlers::token_history))
        .route("/tokens/clear", post(handlers::clear_tokens))
        .layer(TraceLayer::new_for_http())
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
