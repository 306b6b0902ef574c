// src/routes.rs
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::git_http;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Smart HTTP, upload-pack only
        .route("/:repo/info/refs", get(git_http::git_info_refs))
        .route("/:repo/git-upload-pack", post(git_http::git_upload_pack))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
}
