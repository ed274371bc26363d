use axum::{Router, body::Bytes, extract::State, routing::{get, post}, Json, http::{HeaderMap, StatusCode}};
use chrono::Utc;
use mongodb::{
    bson::{doc, Bson, DateTime as BsonDateTime, Document},
    options::ReturnDocument,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::accounts::{extend_subscription, load_user, record_reward, user_oid};
use crate::billing::RewardKind;
use crate::error::{is_duplicate_key, ApiError};
use crate::integrations::GatewayOrder;
use crate::models::{Role, PAYMENTS, USERS};
use crate::routes::common::{ApiResult, data_response, data_response_with_status, get_i64, now_datetime, require_role};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Deserialize)]
struct OrderRequest {
    amount: i64,
}

#[derive(Deserialize)]
struct VerifyRequest {
    order_id: String,
    payment_id: String,
    signature: String,
    #[serde(default)]
    amount: f64,
}

#[derive(Deserialize)]
struct CoinPurchaseRequest {
    razorpay_order_id: String,
    razorpay_payment_id: String,
    razorpay_signature: String,
    coins_to_add: i64,
    amount_paid: i64,
}

fn order_document(order: GatewayOrder) -> Document{
    doc! { "id": order.id, "amount": order.amount, "currency": order.currency }
}

/// Marks a payment as verified by its payer. The webhook may have stored the
/// row first, so the client only `$set`s fields the webhook never writes.
pub fn client_verification(user_id: &str, order_id: &str, signature: &str, amount: Bson, purpose: &str, at: BsonDateTime) -> Document{
    doc! {
        "$set": {
            "client_verified": true,
            "user_id": user_id,
            "purpose": purpose,
            "method": "client_verification",
            "verified_at": at,
        },
        "$setOnInsert": {
            "order_id": order_id,
            "signature": signature,
            "amount": amount,
            "status": "verified",
            "timestamp": at,
        },
    }
}

/// Payment id and upsert for a `payment.captured` webhook event, `None` for anything else.
pub fn captured_payment(event: &Value, signature: &str, at: BsonDateTime) -> Option<(String, Document)>{
    if event.get("event")?.as_str()? != "payment.captured" {
        return None;
    }
    let entity = event.pointer("/payload/payment/entity")?;
    let payment_id = entity.get("id")?.as_str()?;
    let amount = entity.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
    let update = doc! {
        "$set": {
            "status": "captured",
            "event_type": "payment.captured",
            "payload": mongodb::bson::to_bson(event).unwrap_or(Bson::Null),
            "captured_at": at,
        },
        "$setOnInsert": {
            "order_id": entity.get("order_id").and_then(Value::as_str).unwrap_or_default(),
            "signature": signature,
            "amount": amount / 100.0,
            "timestamp": at,
        },
    };
    Some((payment_id.to_string(), update))
}

/// Upserts one payment row. A unique-index collision means a concurrent
/// writer created the row between match and insert, so the update is tried
/// once more; `false` when the filter still matches nothing.
async fn upsert_payment(state: &AppState, filter: Document, update: Document) -> Result<bool, ApiError>{
    let payments = state.db.collection::<Document>(PAYMENTS);
    for attempt in 0..2 {
        match payments.update_one(filter.clone(), update.clone()).upsert(true).await {
            Ok(_) => return Ok(true),
            Err(e) if is_duplicate_key(&e) => debug!(attempt, "payment upsert collided"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

/// Claims the payment for its payer; a second client verification is a conflict.
async fn claim_client_verification(state: &AppState, payment_id: &str, update: Document) -> Result<(), ApiError>{
    let filter = doc! { "payment_id": payment_id, "client_verified": { "$ne": true } };
    if upsert_payment(state, filter, update).await? {
        Ok(())
    } else {
        Err(ApiError::Conflict("Payment already processed".into()))
    }
}

/// Lets the payer retry after the payment could not be applied.
async fn release_client_verification(state: &AppState, payment_id: &str){
    let released = state.db.collection::<Document>(PAYMENTS)
        .update_one(doc! { "payment_id": payment_id }, doc! { "$unset": { "client_verified": "" } })
        .await;
    if let Err(e) = released {
        error!(payment_id, error = %e, "could not release payment claim");
    }
}

fn check_signature(state: &AppState, order_id: &str, payment_id: &str, signature: &str) -> Result<(), ApiError>{
    if state.payments.verify_payment_signature(order_id, payment_id, signature)? {
        Ok(())
    } else {
        warn!(order_id, payment_id, "payment signature mismatch");
        Err(ApiError::validation("Payment verification failed"))
    }
}

async fn gateway_key(State(state): State<AppState>) -> ApiResult{
    let key = state.payments.key_id().ok_or_else(|| ApiError::Unavailable("Payment gateway is not configured".into()))?;
    Ok(data_response(Bson::Document(doc! { "key": key })))
}

async fn create_order(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<OrderRequest>) -> ApiResult{
    require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    if payload.amount <= 0 {
        return Err(ApiError::validation("Amount must be positive"));
    }
    let order = state.payments.create_order(payload.amount).await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(order_document(order))))
}

async fn verify_payment(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<VerifyRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer, Role::Owner])?;
    check_signature(&state, &payload.order_id, &payload.payment_id, &payload.signature)?;
    let user = load_user(&state.db, &claims).await?;
    let user_id = user_oid(&user)?;

    let claim = client_verification(
        &claims.sub,
        &payload.order_id,
        &payload.signature,
        Bson::Double(payload.amount),
        "subscription",
        now_datetime(),
    );
    claim_client_verification(&state, &payload.payment_id, claim).await?;

    let now = Utc::now();
    let renewed = match extend_subscription(&state.db, user_id, "razorpay", now).await {
        Ok(renewed) => renewed,
        Err(e) => {
            release_client_verification(&state, &payload.payment_id).await;
            return Err(e);
        }
    };
    info!(user = %claims.sub, payment_id = %payload.payment_id, "subscription paid");
    let token = state.tokens.issue_for_user(&renewed, now)?;
    Ok(data_response(Bson::Document(doc! { "access_token": token, "token_type": "bearer" })))
}

async fn create_coin_order(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<OrderRequest>) -> ApiResult{
    require_role(&state, &headers, &[Role::Customer])?;
    if payload.amount <= 0 {
        return Err(ApiError::validation("Invalid amount"));
    }
    let paise = payload.amount.checked_mul(100).ok_or_else(|| ApiError::validation("Invalid amount"))?;
    let order = state.payments.create_order(paise).await?;
    Ok(data_response_with_status(StatusCode::CREATED, Bson::Document(order_document(order))))
}

async fn verify_coin_purchase(State(state): State<AppState>, headers: HeaderMap, Json(payload): Json<CoinPurchaseRequest>) -> ApiResult{
    let claims = require_role(&state, &headers, &[Role::Customer])?;
    if payload.coins_to_add <= 0 || payload.amount_paid <= 0 {
        return Err(ApiError::validation("Coins and amount must be positive"));
    }
    check_signature(&state, &payload.razorpay_order_id, &payload.razorpay_payment_id, &payload.razorpay_signature)?;
    let user = load_user(&state.db, &claims).await?;
    let user_id = user_oid(&user)?;
    let payment_id = payload.razorpay_payment_id.as_str();

    let claim = client_verification(
        &claims.sub,
        &payload.razorpay_order_id,
        &payload.razorpay_signature,
        Bson::Int64(payload.amount_paid),
        "coin_purchase",
        now_datetime(),
    );
    claim_client_verification(&state, payment_id, claim).await?;

    let users = state.db.collection::<Document>(USERS);
    let credited = users
        .find_one_and_update(doc! { "_id": user_id }, doc! { "$inc": { "coins": payload.coins_to_add } })
        .return_document(ReturnDocument::After)
        .await;
    let updated = match credited {
        Ok(Some(updated)) => updated,
        Ok(None) => {
            release_client_verification(&state, payment_id).await;
            return Err(ApiError::not_found("User not found"));
        }
        Err(e) => {
            release_client_verification(&state, payment_id).await;
            return Err(e.into());
        }
    };
    if let Err(e) = record_reward(&state.db, &updated, payload.coins_to_add, RewardKind::Purchase, Utc::now()).await {
        if let Err(undo) = users.update_one(doc! { "_id": user_id }, doc! { "$inc": { "coins": -payload.coins_to_add } }).await {
            error!(user = %claims.sub, error = %undo, "could not reverse coin credit");
        }
        release_client_verification(&state, payment_id).await;
        return Err(e);
    }

    info!(user = %claims.sub, coins = payload.coins_to_add, "coins purchased");
    Ok(data_response(Bson::Document(doc! {
        "message": format!("{} coins added successfully.", payload.coins_to_add),
        "updated_coins": get_i64(&updated, "coins").unwrap_or(0),
    })))
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !state.payments.verify_webhook_signature(&body, &signature)? {
        warn!("webhook signature mismatch");
        return Err(ApiError::validation("Invalid signature"));
    }
    let event: Value = serde_json::from_slice(&body).map_err(|_| ApiError::validation("Invalid webhook payload"))?;

    if let Some((payment_id, update)) = captured_payment(&event, &signature, now_datetime()) {
        if upsert_payment(&state, doc! { "payment_id": &payment_id }, update).await? {
            info!(payment_id = %payment_id, "captured payment stored");
        } else {
            warn!(payment_id = %payment_id, "captured payment could not be stored");
        }
    }
    Ok(data_response(Bson::Document(doc! { "status": "success" })))
}

pub fn payments_router(state: AppState) -> Router{
    Router::new()
        .route("/key", get(gateway_key))
        .route("/orders", post(create_order))
        .route("/verify", post(verify_payment))
        .route("/coin-orders", post(create_coin_order))
        .route("/coin-purchases/verify", post(verify_coin_purchase))
        .route("/webhook", post(webhook))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(update: &Document, op: &str) -> Vec<String> {
        update.get_document(op).unwrap().keys().cloned().collect()
    }

    #[test]
    fn captured_events_become_payment_upserts() {
        let event = json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": { "id": "pay_1", "order_id": "order_9", "amount": 9900 } } },
        });
        let (payment_id, update) = captured_payment(&event, "sig", BsonDateTime::now()).unwrap();
        assert_eq!(payment_id, "pay_1");
        let inserted = update.get_document("$setOnInsert").unwrap();
        assert_eq!(inserted.get_str("order_id").unwrap(), "order_9");
        assert_eq!(inserted.get_f64("amount").unwrap(), 99.0);
        assert_eq!(update.get_document("$set").unwrap().get_str("status").unwrap(), "captured");
    }

    #[test]
    fn other_events_are_ignored() {
        let at = BsonDateTime::now();
        assert!(captured_payment(&json!({ "event": "payment.failed" }), "sig", at).is_none());
        assert!(captured_payment(&json!({ "event": "payment.captured", "payload": {} }), "sig", at).is_none());
    }

    #[test]
    fn webhook_and_client_writes_do_not_overwrite_each_other() {
        let at = BsonDateTime::now();
        let event = json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": { "id": "pay_1", "order_id": "order_9", "amount": 100 } } },
        });
        let (_, captured) = captured_payment(&event, "sig", at).unwrap();
        let client = client_verification("user", "order_9", "sig", Bson::Double(1.0), "subscription", at);

        for update in [&captured, &client] {
            let set = keys(update, "$set");
            assert!(keys(update, "$setOnInsert").iter().all(|k| !set.contains(k)));
        }
        let client_set = keys(&client, "$set");
        assert!(keys(&captured, "$set").iter().all(|k| !client_set.contains(k)));
        assert!(client_set.contains(&"client_verified".to_string()));
    }
}
