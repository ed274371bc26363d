use axum::{Router, extract::State, routing::post, Json, http::HeaderMap};
use chrono::Utc;
use mongodb::{bson::{doc, Bson, Document}, options::ReturnDocument};
use serde::Deserialize;
use tracing::info;

use crate::accounts::{load_user, record_reward, user_oid};
use crate::billing::{self, RewardKind};
use crate::error::ApiError;
use crate::models::{Role, REFERRAL_TRANSACTIONS, USERS};
use crate::routes::common::{ApiResult, data_response, document_id, get_i64, get_string, require_role, to_bson_datetime};
use crate::state::AppState;

#[derive(Deserialize)]
struct ApplyReferralRequest {
    referral_code: String,
}

/// Upper-cased code, or `None` when it cannot be a referral code.
pub fn normalize_referral_code(raw: &str) -> Option<String>{
    let code = raw.trim().to_ascii_uppercase();
    (code.len() == 6 && code.chars().all(|c| c.is_ascii_alphanumeric())).then_some(code)
}

async fn apply_referral(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<ApplyReferralRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let code = normalize_referral_code(&payload.referral_code)
        .ok_or_else(|| ApiError::validation("Referral codes are 6 letters or digits"))?;

    let users = state.db.collection::<Document>(USERS);
    let referrer = users.find_one(doc! { "referral_code": &code })
        .await?
        .ok_or_else(|| ApiError::not_found("Invalid referral code"))?;
    let customer = load_user(&state.db, &claims).await?;
    let customer_id = user_oid(&customer)?;
    let referrer_id = user_oid(&referrer)?;

    if referrer_id == customer_id {
        return Err(ApiError::validation("Self-referral not allowed"));
    }

    // Claiming the flag first makes a second apply fail even under concurrent requests.
    let now = Utc::now();
    let claimed = users.find_one_and_update(
        doc! { "_id": customer_id, "hasEnteredReferral": { "$ne": true } },
        doc! {
            "$set": { "hasEnteredReferral": true },
            "$inc": { "coins": billing::REFERRAL_REWARD_COINS },
        },
    )
    .return_document(ReturnDocument::After)
    .await?
    .ok_or_else(|| ApiError::validation("Referral already used"))?;

    if get_string(&referrer, "role").as_deref() == Some(Role::Owner.as_str()) {
        users.update_one(
            doc! { "_id": referrer_id },
            doc! { "$inc": { "referral_earnings": billing::OWNER_REFERRAL_EARNING_INR, "referral_count": 1_i64 } },
        ).await?;
    } else {
        users.update_one(
            doc! { "_id": referrer_id },
            doc! { "$inc": { "coins": billing::REFERRAL_REWARD_COINS, "referral_count": 1_i64 } },
        ).await?;
        record_reward(&state.db, &referrer, billing::REFERRAL_REWARD_COINS, RewardKind::ReferralBonus, now).await?;
    }
    record_reward(&state.db, &claimed, billing::REFERRAL_REWARD_COINS, RewardKind::Referral, now).await?;

    state.db.collection::<Document>(REFERRAL_TRANSACTIONS)
        .insert_one(doc! {
            "referrer_id": referrer_id.to_hex(),
            "customer_id": customer_id.to_hex(),
            "code": &code,
            "timestamp": to_bson_datetime(now),
        })
        .await?;

    info!(referrer = %referrer_id, customer = %customer_id, "referral applied");
    let token = state.tokens.issue_for_user(&claimed, now)?;
    Ok(data_response(Bson::Document(doc! {
        "message": "Referral applied successfully",
        "access_token": token,
        "token_type": "bearer",
        "updated_coins": get_i64(&claimed, "coins").unwrap_or(0),
    })))
}

async fn skip_referral(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    let updated = state.db.collection::<Document>(USERS)
        .find_one_and_update(doc! { "_id": user_oid(&user)? }, doc! { "$set": { "hasEnteredReferral": true } })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    info!(user = %document_id(&updated).unwrap_or_default(), "referral skipped");
    let token = state.tokens.issue_for_user(&updated, Utc::now())?;
    Ok(data_response(Bson::Document(doc! { "access_token": token, "token_type": "bearer" })))
}

pub fn referral_router(state: AppState) -> Router{
    Router::new()
        .route("/apply", post(apply_referral))
        .route("/skip", post(skip_referral))
        .with_state(state)
}
