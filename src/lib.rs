use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

pub mod accounts;
pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod integrations;
pub mod models;
pub mod notifications;
pub mod routes;
pub mod state;
pub mod tokens;

use crate::state::AppState;

/// The full HTTP application: every router plus tracing, CORS and the JSON 404.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    routes::api_router(state)
        .fallback(not_found)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(allowed)
}

async fn not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("Endpoint not found: {}", uri.path()), "code": "route.not_found" })),
    )
        .into_response()
}
