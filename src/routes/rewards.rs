use axum::{Router, extract::State, routing::{get, post}, Json, http::{HeaderMap, StatusCode}};
use chrono::{DateTime, Utc};
use mongodb::{bson::{doc, Bson, Document}, options::ReturnDocument};
use serde::Deserialize;
use tracing::info;

use crate::accounts::{active_coins, load_user, record_reward, user_oid};
use crate::billing::{self, RewardKind};
use crate::error::ApiError;
use crate::models::{Role, USERS};
use crate::routes::common::{ApiResult, data_response, data_response_with_status, get_i64, require_role};
use crate::state::AppState;

#[derive(Deserialize)]
struct GrantRequest {
    coins: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct TransactionRequest {
    coins: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<String>,
}

fn parse_kind(raw: &str) -> Result<RewardKind, ApiError>{
    RewardKind::parse(raw.trim()).ok_or_else(|| ApiError::validation(format!("Unknown reward type: {raw}")))
}

/// Coins actually credited for a grant; checkouts always earn the fixed reward.
pub fn grant_amount(kind: RewardKind, requested: i64) -> Result<i64, ApiError>{
    match kind {
        RewardKind::Checkout => Ok(billing::CHECKOUT_REWARD_COINS),
        RewardKind::Subscription => Err(ApiError::validation("Subscription spends are not grants")),
        _ if requested > 0 => Ok(requested),
        _ => Err(ApiError::validation("coins must be positive")),
    }
}

fn parse_timestamp(raw: Option<&str>, now: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError>{
    match raw {
        None => Ok(now),
        Some(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| ApiError::validation("timestamp must be RFC 3339")),
    }
}

async fn coin_balance(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    let active = active_coins(&state.db, &user, Utc::now()).await?;
    Ok(data_response(Bson::Document(doc! {
        "total_coins": get_i64(&user, "coins").unwrap_or(0),
        "active_coins": active,
    })))
}

async fn grant_coins(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<GrantRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let kind = parse_kind(&payload.kind)?;
    let coins = grant_amount(kind, payload.coins)?;
    let user = load_user(&state.db, &claims).await?;

    let now = Utc::now();
    let updated = state.db.collection::<Document>(USERS)
        .find_one_and_update(doc! { "_id": user_oid(&user)? }, doc! { "$inc": { "coins": coins } })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    record_reward(&state.db, &updated, coins, kind, now).await?;

    info!(user = %claims.sub, coins, kind = kind.as_str(), "coins granted");
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! {
        "coins_added": coins,
        "updated_coins": get_i64(&updated, "coins").unwrap_or(0),
    })))
}

async fn record_transaction(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<TransactionRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let kind = parse_kind(&payload.kind)?;
    if payload.coins == 0 {
        return Err(ApiError::validation("coins must not be zero"));
    }
    let at = parse_timestamp(payload.timestamp.as_deref(), Utc::now())?;
    let user = load_user(&state.db, &claims).await?;
    record_reward(&state.db, &user, payload.coins, kind, at).await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(doc! { "recorded": true })))
}

pub fn rewards_router(state: AppState) -> Router{
    Router::new()
        .route("/", post(grant_coins))
        .route("/coins", get(coin_balance))
        .route("/transactions", post(record_transaction))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn checkout_grants_are_fixed() {
        assert_eq!(grant_amount(RewardKind::Checkout, 500).unwrap(), 3);
        assert_eq!(grant_amount(RewardKind::Manual, 10).unwrap(), 10);
        assert!(grant_amount(RewardKind::Manual, 0).is_err());
        assert!(grant_amount(RewardKind::Subscription, 450).is_err());
    }

    #[test]
    fn transaction_timestamps_default_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(parse_timestamp(None, now).unwrap(), now);
        assert_eq!(
            parse_timestamp(Some("2024-05-01T10:00:00+05:30"), now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 4, 30, 0).unwrap(),
        );
        assert!(parse_timestamp(Some("yesterday"), now).is_err());
    }
}
