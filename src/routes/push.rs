use axum::{Router, routing::post, extract::State, Json, http::HeaderMap};
use axum::http::StatusCode;
use mongodb::bson::{doc, Bson, Document};
use serde::Deserialize;
use tracing::debug;

use crate::accounts::{load_user, user_oid};
use crate::error::ApiError;
use crate::models::{Role, USERS};
use crate::routes::common::{ApiResult, data_response, data_response_with_status, now_datetime, require_role};
use crate::state::AppState;

#[derive(Deserialize)]
struct RegisterPushRequest {
    token: String,
    #[serde(default)]
    platform: Option<String>,
}

#[derive(Deserialize)]
struct UnregisterPushRequest {
    token: String,
}

fn required_token(raw: &str) -> Result<String, ApiError>{
    let token = raw.trim();
    if token.is_empty() {
        return Err(ApiError::validation("token required"));
    }
    Ok(token.to_string())
}

async fn register_push(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<RegisterPushRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let token = required_token(&payload.token)?;
    let user = load_user(&state.db, &claims).await?;

    let mut set = doc! { "push_updated_at": now_datetime() };
    if let Some(platform) = payload.platform.filter(|p| !p.trim().is_empty()) {
        set.insert("push_platform", platform);
    }
    state.db.collection::<Document>(USERS)
        .update_one(
            doc! { "_id": user_oid(&user)? },
            doc! { "$addToSet": { "fcm_tokens": &token }, "$set": set },
        )
        .await?;

    debug!(user = %claims.sub, "device token registered");
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "ok": true })))
}

async fn unregister_push(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<UnregisterPushRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let token = required_token(&payload.token)?;
    let user = load_user(&state.db, &claims).await?;

    state.db.collection::<Document>(USERS)
        .update_one(doc! { "_id": user_oid(&user)? }, doc! { "$pull": { "fcm_tokens": &token } })
        .await?;
    Ok(data_response(Bson::Document(doc! { "ok": true })))
}

pub fn push_router(state: AppState) -> Router{
    Router::new()
        .route("/register", post(register_push))
        .route("/unregister", post(unregister_push))
        .with_state(state)
}
