mod auth;
mod backend;
mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::server::AppState;

pub fn git_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{owner}/{repo}/info/refs", get(handlers::info_refs))
        .route(
            "/{owner}/{repo}/git-upload-pack",
            post(handlers::git_upload_pack),
        )
        .route(
            "/{owner}/{repo}/git-receive-pack",
            post(handlers::git_receive_pack),
        )
}
