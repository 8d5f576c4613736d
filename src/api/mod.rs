pub mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use hyper::header;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::sandbox::manager::PreviewManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PreviewManager>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_router())
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/previews",
            post(handlers::create_preview).get(handlers::list_previews),
        )
        .route(
            "/previews/{project_id}",
            get(handlers::preview_status).delete(handlers::destroy_preview),
        )
        .route(
            "/previews/{project_id}/extend",
            post(handlers::extend_preview),
        )
        .route("/previews/{project_id}/logs", get(handlers::preview_logs))
        .route(
            "/previews/{project_id}/logs/stream",
            get(stream::stream_logs),
        )
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let info = state.manager.provider_info();
    Json(json!({
        "status": "ok",
        "provider": info.kind.as_str(),
        "active": state.manager.active().await,
        "capacity": state.manager.capacity(),
    }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}
