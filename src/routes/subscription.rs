use axum::{Router, extract::State, routing::{get, post}, http::HeaderMap};
use chrono::{DateTime, Utc};
use mongodb::{bson::{doc, oid::ObjectId, Bson, Document}, options::ReturnDocument};
use tracing::{error, info};

use crate::accounts::{active_coins, claim_redemption, extend_subscription, load_user, record_reward, release_redemption, user_oid};
use crate::billing::{self, RewardKind, SubscriptionStatus};
use crate::error::ApiError;
use crate::models::{Role, REWARDS, USERS};
use crate::routes::common::{ApiResult, data_response, get_datetime, get_i64, require_role};
use crate::state::AppState;

async fn current_status(state: &AppState, user: &Document, role: Role, now: DateTime<Utc>) -> Result<SubscriptionStatus, ApiError>{
    let active = active_coins(&state.db, user, now).await?;
    Ok(billing::evaluate(get_datetime(user, "next_payment_date"), now, active, role))
}

fn phase_document(user: &Document, now: DateTime<Utc>) -> Document{
    let created = get_datetime(user, "created_at").unwrap_or(now);
    let (phase, months) = billing::phase_for(created, now);
    phase.to_document(months)
}

fn next_payment_bson(user: &Document) -> Bson{
    get_datetime(user, "next_payment_date")
        .map(|d| Bson::String(d.to_rfc3339()))
        .unwrap_or(Bson::Null)
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    let status = current_status(&state, &user, claims.role, Utc::now()).await?;
    Ok(data_response(Bson::Document(status.to_document())))
}

async fn phase(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    Ok(data_response(Bson::Document(phase_document(&user, Utc::now()))))
}

async fn details(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    let now = Utc::now();
    let status = current_status(&state, &user, claims.role, now).await?;
    Ok(data_response(Bson::Document(doc! {
        "coins": get_i64(&user, "coins").unwrap_or(0),
        "next_payment_date": next_payment_bson(&user),
        "base_amount": billing::SUBSCRIPTION_COST_COINS,
        "referral_earnings": get_i64(&user, "referral_earnings").unwrap_or(0),
        "status": status.to_document(),
        "phase": phase_document(&user, now),
    })))
}

async fn next_payment_date(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    Ok(data_response(Bson::Document(doc! { "next_payment_date": next_payment_bson(&user) })))
}

async fn refund_coins(state: &AppState, user_id: ObjectId, coins: i64){
    let refunded = state.db.collection::<Document>(USERS)
        .update_one(doc! { "_id": user_id }, doc! { "$inc": { "coins": coins } })
        .await;
    if let Err(e) = refunded {
        error!(user_id = %user_id, coins, error = %e, "could not refund coins");
    }
}

/// Debits the subscription cost and extends the subscription. Runs with the
/// redemption lease held; a failed step undoes the earlier ones.
async fn redeem_under_lease(state: &AppState, user_id: ObjectId, now: DateTime<Utc>) -> Result<Document, ApiError>{
    let cost = billing::SUBSCRIPTION_COST_COINS;
    let users = state.db.collection::<Document>(USERS);
    let user = users
        .find_one(doc! { "_id": user_id })
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    if active_coins(&state.db, &user, now).await? < cost {
        return Err(ApiError::validation("Not enough coins"));
    }

    let debited = users
        .find_one_and_update(
            doc! { "_id": user_id, "coins": { "$gte": cost } },
            doc! { "$inc": { "coins": -cost } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::validation("Not enough coins"))?;
    let entry_id = match record_reward(&state.db, &debited, -cost, RewardKind::Subscription, now).await {
        Ok(id) => id,
        Err(e) => {
            refund_coins(state, user_id, cost).await;
            return Err(e);
        }
    };

    match extend_subscription(&state.db, user_id, "coins", now).await {
        Ok(renewed) => Ok(renewed),
        Err(e) => {
            refund_coins(state, user_id, cost).await;
            if let Err(undo) = state.db.collection::<Document>(REWARDS).delete_one(doc! { "_id": entry_id }).await {
                error!(user_id = %user_id, error = %undo, "could not remove redemption ledger entry");
            }
            Err(e)
        }
    }
}

async fn redeem(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer])?;
    let user = load_user(&state.db, &claims).await?;
    let user_id = user_oid(&user)?;
    let now = Utc::now();

    if !claim_redemption(&state.db, user_id, now).await? {
        return Err(ApiError::Conflict("A redemption is already in progress".into()));
    }
    let redeemed = redeem_under_lease(&state, user_id, now).await;
    release_redemption(&state.db, user_id).await;
    let renewed = redeemed?;

    let cost = billing::SUBSCRIPTION_COST_COINS;
    info!(user = %claims.sub, coins = cost, "subscription redeemed with coins");
    let token = state.tokens.issue_for_user(&renewed, now)?;
    Ok(data_response(Bson::Document(doc! {
        "access_token": token,
        "token_type": "bearer",
        "coins_used": cost,
        "updated_coins": get_i64(&renewed, "coins").unwrap_or(0),
        "next_payment_date": next_payment_bson(&renewed),
    })))
}

async fn renew_with_referral(State(state): State<AppState>, headers: HeaderMap) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Owner])?;
    let user = load_user(&state.db, &claims).await?;
    let user_id = user_oid(&user)?;
    let cost = billing::OWNER_SUBSCRIPTION_COST_INR;

    state.db.collection::<Document>(USERS)
        .find_one_and_update(
            doc! { "_id": user_id, "referral_earnings": { "$gte": cost } },
            doc! { "$inc": { "referral_earnings": -cost } },
        )
        .await?
        .ok_or_else(|| ApiError::validation("Not enough referral earnings"))?;

    let now = Utc::now();
    let renewed = extend_subscription(&state.db, user_id, "referral", now).await?;
    info!(owner = %claims.sub, amount = cost, "subscription renewed from referral earnings");
    let token = state.tokens.issue_for_user(&renewed, now)?;
    Ok(data_response(Bson::Document(doc! {
        "access_token": token,
        "token_type": "bearer",
        "referral_earnings": get_i64(&renewed, "referral_earnings").unwrap_or(0),
        "next_payment_date": next_payment_bson(&renewed),
    })))
}

pub fn subscription_router(state: AppState) -> Router{
    Router::new()
        .route("/status", get(status))
        .route("/phase", get(phase))
        .route("/details", get(details))
        .route("/next-payment-date", get(next_payment_date))
        .route("/redeem", post(redeem))
        .route("/renew-with-referral", post(renew_with_referral))
        .with_state(state)
}
