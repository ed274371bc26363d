use axum::{Json, Router, extract::State, http::StatusCode, response::{IntoResponse, Response}, routing::get};
use serde_json::json;
use tracing::error;

use crate::db;
use crate::state::AppState;

async fn health(State(state): State<AppState>) -> Response{
    if db::ping(&state.db).await {
        Json(json!({ "status": "ok", "database": "connected" })).into_response()
    } else {
        error!("health check could not reach the database");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "database": "disconnected" })),
        )
            .into_response()
    }
}

pub fn health_router(state: AppState) -> Router{
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}
